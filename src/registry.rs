//! Device lifecycle and power-source negotiation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::acquisition::{AcquisitionError, AcquisitionSettings, BlockReadyFlag, DeviceState};
use crate::buffers::BufferPool;
use crate::capabilities::{capabilities_for, ModelCapabilities, Range};
use crate::channels::{ChannelContext, ChannelError, ChannelSetting, ChannelStore};
use crate::driver::{
    Channel, DigitalPort, DriverError, Handle, InfoLine, PowerNotice, PowerSource, Resolution,
    ScopeDriver,
};
use crate::streaming::StreamingPipeline;
use crate::trigger_config::TriggerSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("no matching device found")]
    NotFound,

    #[error("device is already open")]
    AlreadyOpen,

    #[error("unsupported model variant {0:?}")]
    UnknownVariant(String),

    #[error("openUnit failed: {0}")]
    Driver(#[source] DriverError),
}

impl From<DriverError> for OpenError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::NotFound => Self::NotFound,
            DriverError::AlreadyOpen => Self::AlreadyOpen,
            other => Self::Driver(other),
        }
    }
}

/// The info lines of `getUnitInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub driver: String,
    pub usb: String,
    pub hardware: String,
    pub variant: String,
    pub serial: String,
    pub cal_date: String,
    pub kernel: String,
    pub firmware1: String,
    pub firmware2: String,
}

impl fmt::Display for UnitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Driver Version    : {}", self.driver)?;
        writeln!(f, "USB Version       : {}", self.usb)?;
        writeln!(f, "Hardware Version  : {}", self.hardware)?;
        writeln!(f, "Variant Info      : {}", self.variant)?;
        writeln!(f, "Serial            : {}", self.serial)?;
        writeln!(f, "Cal. Date         : {}", self.cal_date)?;
        writeln!(f, "Kernel Version    : {}", self.kernel)?;
        writeln!(f, "Firmware 1        : {}", self.firmware1)?;
        write!(f, "Firmware 2        : {}", self.firmware2)
    }
}

type OpenHandles = Arc<Mutex<BTreeSet<Handle>>>;

fn lock(handles: &Mutex<BTreeSet<Handle>>) -> MutexGuard<'_, BTreeSet<Handle>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens devices through one driver and tracks which handles are live.
#[derive(Clone)]
pub struct DeviceRegistry {
    driver: Arc<dyn ScopeDriver>,
    open: OpenHandles,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("open", &self.open_handles())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn ScopeDriver>) -> Self {
        Self {
            driver,
            open: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn open_handles(&self) -> Vec<Handle> {
        lock(&self.open).iter().copied().collect()
    }

    /// Opens the unit with `serial`, or the first free one.
    ///
    /// A unit that reports a power notice opens restricted to USB power; see
    /// [`Device::acknowledge_power_source`].
    pub fn open(&self, serial: Option<&str>) -> Result<Device, OpenError> {
        log::debug!("openUnit({serial:?})");
        let opened = self.driver.open_unit(serial)?;
        let handle = opened.handle;
        if !lock(&self.open).insert(handle) {
            return Err(OpenError::AlreadyOpen);
        }

        match self.describe_opened(handle) {
            Ok((caps, serial, max_adc)) => {
                let power = match opened.power_notice {
                    Some(notice) => {
                        log::info!("{serial}: {notice:?}, running on USB power until acknowledged");
                        PowerSource::UsbOnly
                    }
                    None => PowerSource::MainsConnected,
                };
                log::debug!("opened {} {serial} as handle {handle}", caps.variant);
                Ok(Device {
                    handle,
                    driver: Arc::clone(&self.driver),
                    caps,
                    serial,
                    power,
                    power_notice: opened.power_notice,
                    resolution: caps.default_resolution(),
                    max_adc,
                    channels: ChannelStore::new(caps),
                    buffers: BufferPool::new(),
                    trigger: TriggerSpec::None,
                    state: DeviceState::Open,
                    settings: None,
                    block_ready: None,
                    pipeline: None,
                    running: false,
                    open: Arc::clone(&self.open),
                })
            }
            Err(error) => {
                if let Err(close) = self.driver.close_unit(handle) {
                    log::warn!("closeUnit({handle}) after failed open: {close}");
                }
                lock(&self.open).remove(&handle);
                Err(error)
            }
        }
    }

    fn describe_opened(
        &self,
        handle: Handle,
    ) -> Result<(&'static ModelCapabilities, String, i16), OpenError> {
        let variant = self.driver.unit_info(handle, InfoLine::VariantInfo)?;
        let caps = capabilities_for(&variant).ok_or(OpenError::UnknownVariant(variant))?;
        let serial = self.driver.unit_info(handle, InfoLine::BatchAndSerial)?;
        let max_adc = self.driver.maximum_value(handle)?;
        Ok((caps, serial, max_adc))
    }
}

/// One opened oscilloscope. Owns its channel settings and buffers.
pub struct Device {
    pub(crate) handle: Handle,
    pub(crate) driver: Arc<dyn ScopeDriver>,
    pub(crate) caps: &'static ModelCapabilities,
    serial: String,
    pub(crate) power: PowerSource,
    power_notice: Option<PowerNotice>,
    pub(crate) resolution: Resolution,
    pub(crate) max_adc: i16,
    pub(crate) channels: ChannelStore,
    pub(crate) buffers: BufferPool,
    pub(crate) trigger: TriggerSpec,
    pub(crate) state: DeviceState,
    pub(crate) settings: Option<AcquisitionSettings>,
    pub(crate) block_ready: Option<Arc<BlockReadyFlag>>,
    pub(crate) pipeline: Option<Arc<StreamingPipeline>>,
    /// A capture is armed in the driver and has not been stopped yet.
    pub(crate) running: bool,
    open: OpenHandles,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("variant", &self.caps.variant)
            .field("serial", &self.serial)
            .field("power", &self.power)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn capabilities(&self) -> &'static ModelCapabilities {
        self.caps
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn power_source(&self) -> PowerSource {
        self.power
    }

    /// Set after open when the unit asked for its power source to be acknowledged.
    pub fn power_notice(&self) -> Option<PowerNotice> {
        self.power_notice
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Full-scale ADC count at the current resolution.
    pub fn max_adc_value(&self) -> i16 {
        self.max_adc
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub(crate) fn channel_context(&self) -> ChannelContext<'static> {
        ChannelContext {
            caps: self.caps,
            resolution: self.resolution,
            power: self.power,
        }
    }

    pub fn describe(&self) -> Result<UnitInfo, AcquisitionError> {
        let line = |line| {
            self.driver
                .unit_info(self.handle, line)
                .map_err(AcquisitionError::driver("getUnitInfo"))
        };
        Ok(UnitInfo {
            driver: line(InfoLine::DriverVersion)?,
            usb: line(InfoLine::UsbVersion)?,
            hardware: line(InfoLine::HardwareVersion)?,
            variant: line(InfoLine::VariantInfo)?,
            serial: line(InfoLine::BatchAndSerial)?,
            cal_date: line(InfoLine::CalDate)?,
            kernel: line(InfoLine::KernelVersion)?,
            firmware1: line(InfoLine::Firmware1)?,
            firmware2: line(InfoLine::Firmware2)?,
        })
    }

    /// Confirms the power source after a notice or a mid-session supply change.
    ///
    /// Switching to mains lifts the USB-only channel limit without reopening. Switching to USB
    /// fails while more channels are enabled than USB power allows.
    pub fn acknowledge_power_source(&mut self, source: PowerSource) -> Result<(), AcquisitionError> {
        self.ensure_idle()?;
        let ctx = ChannelContext {
            power: source,
            ..self.channel_context()
        };
        self.channels.check_quota(&ctx).map_err(|source| AcquisitionError::Channel {
            operation: "changePowerSource",
            source,
        })?;
        log::debug!("changePowerSource({source:?})");
        self.driver
            .change_power_source(self.handle, source)
            .map_err(AcquisitionError::driver("changePowerSource"))?;
        if source != self.power {
            log::info!(
                "{}: power source {:?} -> {source:?}, channel quota now {}",
                self.serial,
                self.power,
                ctx.quota()
            );
        }
        self.power = source;
        self.power_notice = None;
        Ok(())
    }

    /// Asks the driver which supply it is running on. A supply change surfaces as
    /// [`DriverError::PowerSourceNeedsAcknowledgement`].
    pub fn current_power_source(&self) -> Result<PowerSource, AcquisitionError> {
        self.driver
            .current_power_source(self.handle)
            .map_err(AcquisitionError::driver("currentPowerSource"))
    }

    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<(), AcquisitionError> {
        self.ensure_idle()?;
        if !self.caps.supports_resolution(resolution) {
            return Err(AcquisitionError::Channel {
                operation: "setResolution",
                source: ChannelError::ResolutionIncompatible(resolution),
            });
        }
        let ctx = ChannelContext {
            resolution,
            ..self.channel_context()
        };
        self.channels
            .check_quota(&ctx)
            .map_err(|source| AcquisitionError::Channel {
                operation: "setResolution",
                source,
            })?;

        log::debug!("setResolution({resolution})");
        self.driver
            .set_resolution(self.handle, resolution)
            .map_err(AcquisitionError::driver("setResolution"))?;
        self.resolution = resolution;
        self.max_adc = self
            .driver
            .maximum_value(self.handle)
            .map_err(AcquisitionError::driver("maximumValue"))?;
        if let TriggerSpec::Simple(simple) = &self.trigger {
            let range = self.channels.get(simple.source).map_or(Range::R5V, |s| s.range);
            let adc = simple.to_adc(range, self.max_adc)?;
            self.send_simple_trigger(simple.threshold_mv, &adc)?;
        }
        Ok(())
    }

    /// Validates `setting` against the model and forwards it to the driver. Repeating the
    /// current setting succeeds without changing anything.
    pub fn set_channel(
        &mut self,
        channel: Channel,
        setting: ChannelSetting,
    ) -> Result<(), AcquisitionError> {
        self.ensure_idle()?;
        let ctx = self.channel_context();
        let rejected = |source| AcquisitionError::Channel {
            operation: "setChannel",
            source,
        };
        self.channels
            .validate(channel, &setting, &ctx)
            .map_err(rejected)?;
        // a simple trigger holds its threshold in counts of its source's range
        let retrigger = match &self.trigger {
            TriggerSpec::Simple(simple)
                if simple.source == channel
                    && setting.enabled
                    && self.channels.get(channel).map(|s| s.range) != Some(setting.range) =>
            {
                Some((simple.threshold_mv, simple.to_adc(setting.range, self.max_adc)?))
            }
            _ => None,
        };

        log::debug!(
            "setChannel({channel}, enabled={}, {:?}, {}, offset={})",
            setting.enabled,
            setting.coupling,
            setting.range,
            setting.analogue_offset
        );
        self.driver
            .set_channel(self.handle, channel, &setting)
            .map_err(AcquisitionError::driver("setChannel"))?;
        self.channels.set(channel, setting, &ctx).map_err(rejected)?;
        if let Some((threshold_mv, adc)) = retrigger {
            self.send_simple_trigger(threshold_mv, &adc)?;
        }

        if !setting.enabled {
            self.buffers
                .clear(self.driver.as_ref(), self.handle, channel, 0)?;
            self.buffers.release(channel);
        }
        if self.state == DeviceState::Open {
            self.state = DeviceState::ChannelsSet;
        }
        Ok(())
    }

    pub fn set_digital_port(
        &mut self,
        port: DigitalPort,
        enabled: bool,
        logic_threshold: i16,
    ) -> Result<(), AcquisitionError> {
        self.ensure_idle()?;
        let mut ports = self.channels.clone();
        ports
            .set_digital_port(port, enabled, logic_threshold)
            .map_err(|source| AcquisitionError::Channel {
                operation: "setDigitalPort",
                source,
            })?;
        log::debug!("setDigitalPort({port:?}, enabled={enabled}, threshold={logic_threshold})");
        self.driver
            .set_digital_port(self.handle, port, enabled, logic_threshold)
            .map_err(AcquisitionError::driver("setDigitalPort"))?;
        self.channels = ports;
        Ok(())
    }

    pub fn flash_led(&self, count: i16) -> Result<(), AcquisitionError> {
        self.driver
            .flash_led(self.handle, count)
            .map_err(AcquisitionError::driver("flashLed"))
    }

    /// Stops any capture, unregisters every buffer and releases the handle.
    pub fn close(mut self) -> Result<(), AcquisitionError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), AcquisitionError> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        if self.running {
            self.stop()?;
        }
        self.buffers.unpin();
        self.buffers.clear_all(self.driver.as_ref(), self.handle)?;
        log::debug!("closeUnit({})", self.handle);
        let closed = self
            .driver
            .close_unit(self.handle)
            .map_err(AcquisitionError::driver("closeUnit"));
        lock(&self.open).remove(&self.handle);
        self.state = DeviceState::Closed;
        closed
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::warn!("closing handle {} failed: {error}", self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelLimit;
    use crate::simulator::{SimulatedDriver, SimulatorConfig};

    fn registry(configs: Vec<SimulatorConfig>) -> (Arc<SimulatedDriver>, DeviceRegistry) {
        let driver = Arc::new(SimulatedDriver::with_units(configs));
        let registry = DeviceRegistry::new(driver.clone());
        (driver, registry)
    }

    #[test]
    fn test_open_describe_close() {
        let (_, registry) = registry(vec![SimulatorConfig::new("3406D").with_serial("CY123/0001")]);
        let device = registry.open(None).unwrap();
        assert_eq!(device.capabilities().variant, "3406D");
        assert_eq!(device.serial(), "CY123/0001");
        assert_eq!(device.max_adc_value(), 32_512);
        assert_eq!(device.power_notice(), None);

        let info = device.describe().unwrap();
        assert_eq!(info.variant, "3406D");
        assert!(info.to_string().contains("Serial            : CY123/0001"));

        assert_eq!(registry.open_handles(), vec![device.handle()]);
        assert_eq!(registry.open(Some("CY123/0001")).unwrap_err(), OpenError::AlreadyOpen);
        device.close().unwrap();
        assert!(registry.open_handles().is_empty());
    }

    #[test]
    fn test_open_not_found() {
        let (_, registry) = registry(vec![SimulatorConfig::new("2204A")]);
        assert_eq!(registry.open(Some("nope")).unwrap_err(), OpenError::NotFound);
        let first = registry.open(None).unwrap();
        assert_eq!(registry.open(None).unwrap_err(), OpenError::NotFound);
        drop(first);
        assert!(registry.open(None).is_ok());
    }

    #[test]
    fn test_power_acknowledgement_lifts_quota() {
        let config = SimulatorConfig::new("3406D").on_usb_power();
        let serial = config.serial.clone();
        let (driver, registry) = registry(vec![config]);
        let mut device = registry.open(None).unwrap();
        assert_eq!(device.power_notice(), Some(PowerNotice::PowerSupplyNotConnected));
        assert_eq!(device.power_source(), PowerSource::UsbOnly);

        let on = ChannelSetting::enabled(Range::R1V);
        device.set_channel(Channel::A, on).unwrap();
        device.set_channel(Channel::B, on).unwrap();
        assert!(device.set_channel(Channel::C, on).is_err());

        assert!(matches!(
            device.acknowledge_power_source(PowerSource::MainsConnected),
            Err(AcquisitionError::Driver {
                source: DriverError::PowerSupplyNotConnected,
                ..
            })
        ));
        driver.set_mains_available(&serial, true);
        device
            .acknowledge_power_source(PowerSource::MainsConnected)
            .unwrap();
        assert_eq!(device.power_notice(), None);
        device.set_channel(Channel::C, on).unwrap();
        device.set_channel(Channel::D, on).unwrap();
        assert_eq!(device.channels().enabled_count(), 4);

        // going back to USB would exceed its limit
        assert!(device.acknowledge_power_source(PowerSource::UsbOnly).is_err());
    }

    #[test]
    fn test_resolution_changes_max_adc() {
        let (_, registry) = registry(vec![SimulatorConfig::new("5444D")]);
        let mut device = registry.open(None).unwrap();
        assert_eq!(device.max_adc_value(), 32_512);
        device.set_resolution(Resolution::Bits12).unwrap();
        assert_eq!(device.max_adc_value(), 32_767);

        let on = ChannelSetting::enabled(Range::R1V);
        device.set_channel(Channel::A, on).unwrap();
        device.set_channel(Channel::B, on).unwrap();
        assert!(matches!(
            device.set_resolution(Resolution::Bits16),
            Err(AcquisitionError::Channel {
                operation: "setResolution",
                source: ChannelError::TooManyChannels {
                    quota: 1,
                    limit: ChannelLimit::Resolution(Resolution::Bits16),
                },
            })
        ));
        assert!(matches!(
            device.set_resolution(Resolution::Bits10),
            Err(AcquisitionError::Channel {
                source: ChannelError::ResolutionIncompatible(Resolution::Bits10),
                ..
            })
        ));
    }

    #[test]
    fn test_set_channel_moves_to_channels_set() {
        let (_, registry) = registry(vec![SimulatorConfig::new("2204A")]);
        let mut device = registry.open(None).unwrap();
        assert_eq!(device.state(), DeviceState::Open);
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        assert_eq!(device.state(), DeviceState::ChannelsSet);
        let err = device
            .set_channel(Channel::B, ChannelSetting::enabled(Range::R10mV))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "setChannel failed: range ±10mV is outside ±50mV..=±20V"
        );
    }
}
