//! Sample output.
//!
//! [`RecordSink`] writes one delimited text record per sample index, with an ADC column and
//! optionally a millivolt column per enabled channel. Finished block captures can also be
//! turned into a polars [`DataFrame`] with [`capture_to_frame`].

use std::io::Write;

use polars::prelude::*;

use crate::acquisition::BlockCapture;
use crate::capabilities::Range;
use crate::driver::{Channel, RatioMode};
use crate::registry::Device;
use crate::streaming::{ChannelSamples, LatestWindow};
use crate::units::adc_to_mv;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("DataFrame error: {0}")]
    Polars(#[from] PolarsError),

    #[error("record has {got} channels, header has {expected}")]
    Width { expected: usize, got: usize },
}

/// Consumer of streamed sample windows.
pub trait SampleSink {
    /// Writes every sample of `window`. Returns the number of records written.
    fn write_window(
        &mut self,
        window: &LatestWindow,
        samples: &[ChannelSamples],
    ) -> Result<usize, SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    #[default]
    Csv,
    Tsv,
}

impl RecordFormat {
    pub fn separator(self) -> u8 {
        match self {
            Self::Csv => b',',
            Self::Tsv => b'\t',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scaling {
    /// ADC counts only.
    Raw,
    /// ADC counts followed by millivolts.
    #[default]
    Millivolts,
}

/// Layout of one channel's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelColumn {
    pub channel: Channel,
    pub range: Range,
    /// Values are the per-interval maximum of min/max aggregation.
    pub aggregated: bool,
}

/// Columns for the enabled channels of `device` and its current capture settings.
pub fn columns_for(device: &Device) -> Vec<ChannelColumn> {
    let aggregated = device
        .acquisition()
        .is_some_and(|s| s.ratio_mode == RatioMode::Aggregate);
    device
        .channels()
        .enabled()
        .into_iter()
        .filter_map(|channel| {
            device.channels().get(channel).map(|setting| ChannelColumn {
                channel,
                range: setting.range,
                aggregated,
            })
        })
        .collect()
}

/// Delimited text writer. The header is written before the first record.
#[derive(Debug)]
pub struct RecordSink<W: Write> {
    writer: ::csv::Writer<W>,
    scaling: Scaling,
    max_adc: i16,
    columns: Vec<ChannelColumn>,
    header_written: bool,
    record: ::csv::StringRecord,
    rows: u64,
}

impl<W: Write> RecordSink<W> {
    pub fn new(
        writer: W,
        format: RecordFormat,
        scaling: Scaling,
        max_adc: i16,
        columns: Vec<ChannelColumn>,
    ) -> Self {
        let writer = ::csv::WriterBuilder::new()
            .delimiter(format.separator())
            .has_headers(false)
            .from_writer(writer);
        Self {
            writer,
            scaling,
            max_adc,
            columns,
            header_written: false,
            record: ::csv::StringRecord::new(),
            rows: 0,
        }
    }

    /// A sink laid out for the channels `device` currently has enabled.
    pub fn for_device(writer: W, format: RecordFormat, scaling: Scaling, device: &Device) -> Self {
        Self::new(writer, format, scaling, device.max_adc_value(), columns_for(device))
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flushes buffered records and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()))
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if self.header_written {
            return Ok(());
        }
        let order: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}({})", c.channel, c.range))
            .collect();
        // the comment line is not a record; nothing is buffered yet
        self.writer.flush()?;
        writeln!(self.writer.get_mut(), "# channels: {}", order.join(" "))?;

        let mut names = vec!["sample".to_string()];
        for column in &self.columns {
            let prefix = if column.aggregated { "max_" } else { "" };
            names.push(format!("{}_{prefix}adc", column.channel));
            if self.scaling == Scaling::Millivolts {
                names.push(format!("{}_{prefix}mv", column.channel));
            }
        }
        self.writer.write_record(&names)?;
        self.header_written = true;
        Ok(())
    }

    fn write_records<'s>(
        &mut self,
        first: u64,
        len: usize,
        channels: impl Iterator<Item = &'s [i16]> + Clone,
    ) -> Result<usize, SinkError> {
        let got = channels.clone().count();
        if got != self.columns.len() {
            return Err(SinkError::Width {
                expected: self.columns.len(),
                got,
            });
        }
        self.write_header()?;

        for i in 0..len {
            self.record.clear();
            self.record.push_field(&(first + i as u64).to_string());
            for (column, values) in self.columns.iter().zip(channels.clone()) {
                let raw = values.get(i).copied().unwrap_or(0);
                self.record.push_field(&raw.to_string());
                if self.scaling == Scaling::Millivolts {
                    let mv = adc_to_mv(raw, column.range, self.max_adc);
                    self.record.push_field(&mv.to_string());
                }
            }
            self.writer.write_record(&self.record)?;
        }
        self.rows += len as u64;
        Ok(len)
    }

    /// Writes a finished block capture, numbering records from 0.
    pub fn write_block(&mut self, capture: &BlockCapture) -> Result<usize, SinkError> {
        self.write_records(
            0,
            capture.len(),
            capture.channels.iter().map(|c| c.max.as_slice()),
        )
    }
}

impl<W: Write> SampleSink for RecordSink<W> {
    fn write_window(
        &mut self,
        window: &LatestWindow,
        samples: &[ChannelSamples],
    ) -> Result<usize, SinkError> {
        self.write_records(
            window.first_sample,
            window.len,
            samples.iter().map(|c| c.max.as_slice()),
        )
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

const SAMPLE_COLUMN_NAME: &str = "sample";
const TIME_COLUMN_NAME: &str = "time";

/// A block capture as a frame with `sample`, `time` (seconds) and per-channel
/// `<ch>_adc`/`<ch>_mv` columns. Aggregated captures add `<ch>_min_adc`/`<ch>_min_mv`.
pub fn capture_to_frame(capture: &BlockCapture) -> PolarsResult<DataFrame> {
    let mut df = DataFrame::empty();
    let mut selected = vec![col(SAMPLE_COLUMN_NAME), col(TIME_COLUMN_NAME)];
    for channel in &capture.channels {
        let mut series = vec![(format!("{}_adc", channel.channel), &channel.max)];
        if let Some(min) = &channel.min {
            series.push((format!("{}_min_adc", channel.channel), min));
        }
        for (name, values) in series {
            let mv_name = name.replace("_adc", "_mv");
            let adc: Vec<i32> = values.iter().map(|v| i32::from(*v)).collect();
            let mv: Vec<i32> = values
                .iter()
                .map(|v| adc_to_mv(*v, channel.range, capture.max_adc))
                .collect();
            let column: Column = Series::new(name.as_str().into(), adc).into();
            df.with_column(column)?;
            let column: Column = Series::new(mv_name.as_str().into(), mv).into();
            df.with_column(column)?;
            selected.push(col(name.as_str()));
            selected.push(col(mv_name.as_str()));
        }
    }

    df.lazy()
        .with_row_index(SAMPLE_COLUMN_NAME, Some(0))
        .with_columns([(col(SAMPLE_COLUMN_NAME).cast(DataType::Float64)
            * lit(capture.sample_interval_ns * 1e-9))
        .alias(TIME_COLUMN_NAME)])
        .select(selected)
        .collect()
}

/// Writes `df` as CSV with a header row.
pub fn write_frame_csv<W: Write>(
    df: &mut DataFrame,
    writer: W,
    format: RecordFormat,
) -> Result<(), SinkError> {
    CsvWriter::new(writer)
        .include_header(true)
        .with_separator(format.separator())
        .finish(df)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::ChannelCapture;

    fn columns(aggregated: bool) -> Vec<ChannelColumn> {
        vec![
            ChannelColumn {
                channel: Channel::A,
                range: Range::R5V,
                aggregated,
            },
            ChannelColumn {
                channel: Channel::B,
                range: Range::R1V,
                aggregated,
            },
        ]
    }

    fn samples(a: &[i16], b: &[i16]) -> Vec<ChannelSamples> {
        vec![
            ChannelSamples {
                channel: Channel::A,
                max: a.to_vec(),
                min: None,
            },
            ChannelSamples {
                channel: Channel::B,
                max: b.to_vec(),
                min: None,
            },
        ]
    }

    fn window(first_sample: u64, len: usize) -> LatestWindow {
        LatestWindow {
            first_sample,
            app_start: 0,
            len,
            overflow: 0,
        }
    }

    #[test]
    fn test_csv_with_millivolts() {
        let mut sink = RecordSink::new(
            Vec::new(),
            RecordFormat::Csv,
            Scaling::Millivolts,
            32_512,
            columns(false),
        );
        sink.write_window(&window(0, 2), &samples(&[32_512, 0], &[-16_256, 100]))
            .unwrap();
        sink.write_window(&window(2, 1), &samples(&[-32_512], &[0]))
            .unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.rows(), 3);
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            text,
            "# channels: A(±5V) B(±1V)\n\
             sample,A_adc,A_mv,B_adc,B_mv\n\
             0,32512,5000,-16256,-500\n\
             1,0,0,100,3\n\
             2,-32512,-5000,0,0\n"
        );
    }

    #[test]
    fn test_tsv_raw_aggregated_header() {
        let mut sink = RecordSink::new(
            Vec::new(),
            RecordFormat::Tsv,
            Scaling::Raw,
            32_512,
            columns(true),
        );
        sink.write_window(&window(10, 1), &samples(&[7], &[-7])).unwrap();
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "sample\tA_max_adc\tB_max_adc");
        assert_eq!(lines[2], "10\t7\t-7");
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let mut sink = RecordSink::new(
            Vec::new(),
            RecordFormat::Csv,
            Scaling::Raw,
            32_512,
            columns(false),
        );
        let one = vec![ChannelSamples {
            channel: Channel::A,
            max: vec![1],
            min: None,
        }];
        assert!(matches!(
            sink.write_window(&window(0, 1), &one),
            Err(SinkError::Width {
                expected: 2,
                got: 1
            })
        ));
        assert!(sink.into_inner().unwrap().is_empty());
    }

    fn capture() -> BlockCapture {
        BlockCapture {
            sample_interval_ns: 1_000.0,
            max_adc: 32_512,
            overflow: 0,
            channels: vec![ChannelCapture {
                channel: Channel::A,
                range: Range::R2V,
                max: vec![0, 16_256, 32_512],
                min: Some(vec![0, -16_256, -32_512]),
            }],
        }
    }

    #[test]
    fn test_capture_to_frame() {
        let df = capture_to_frame(&capture()).unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(
            df.get_column_names_str(),
            vec!["sample", "time", "A_adc", "A_mv", "A_min_adc", "A_min_mv"]
        );
        let mv: Vec<i32> = df
            .column("A_mv")
            .unwrap()
            .i32()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(mv, vec![0, 1_000, 2_000]);
        let time: Vec<f64> = df
            .column("time")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!((time[2] - 2e-6).abs() < 1e-12);
    }

    #[test]
    fn test_frame_csv_and_block_records() {
        let capture = capture();
        let mut df = capture_to_frame(&capture).unwrap();
        let mut out = Vec::new();
        write_frame_csv(&mut df, &mut out, RecordFormat::Csv).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("sample,time,A_adc,A_mv,A_min_adc,A_min_mv\n"));
        assert_eq!(text.lines().count(), 4);

        let mut sink = RecordSink::new(
            Vec::new(),
            RecordFormat::Csv,
            Scaling::Millivolts,
            capture.max_adc,
            vec![ChannelColumn {
                channel: Channel::A,
                range: Range::R2V,
                aggregated: true,
            }],
        );
        assert_eq!(sink.write_block(&capture).unwrap(), 3);
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert!(text.ends_with("2,32512,2000\n"));
    }
}
