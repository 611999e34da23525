use alloc::{collections::VecDeque, vec, vec::Vec};
use core::cell::RefCell;

use embassy_futures::select::select;
use embassy_sync::{
    blocking_mutex,
    mutex::{Mutex, MutexGuard},
};
use embassy_time::{Duration, Instant, Timer};

use crate::{
    cmd::{
        CmdCode, CmdError, CmdResult, CommandPort, Mailbox, MailboxPort, CMD_PARAM_MAX,
        CMD_TIMEOUT_MS,
    },
    dma_ring::{RxRing, TxRefusal, TxRing},
    firmware::{
        reset_and_halt, start_ecpu, upload_image, upload_radio, wait_for_init, FirmwareImage,
        LoadError,
    },
    frame::{is_protected, RxFrame, TxError, TxFrame, TxStatus, MAX_FRAME_LEN},
    ie::{self, ids, FirmwareRev, MemoryMap, QueueConfig, RxConfig1, RxConfig2},
    regs::{ChipKind, IrqStatus, Reg, ECPU_CTRL_HALT, HW_ABSENT_16, HW_ABSENT_32},
    sync::{GateTransition, IrqSignal, QueueGate},
    transport::{IrqLine, RegisterBus, Transport, TransportKind},
    txbuf::{BlockAllocator, BLOCK_ALIGN, LINK_SIZE},
    DefaultRawMutex,
};

/// How often [Acx::run] services the device, if no interrupt arrives.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 100;
/// How long a nearly full TX ring may go without any completion, before it's forcibly reset.
pub const TX_STALL_TIMEOUT_MS: u64 = 1000;

/// Minimum time between two recalibrations.
const RECALIB_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive failures, after which recalibration is suspended.
const RECALIB_MAX_FAILURES: u8 = 5;
const RECALIB_BACKOFF: Duration = Duration::from_secs(60);
/// Calibrate DC, AFE DC, TX mismatch and TX LO leakage.
const RADIO_CALIB_METHODS: u32 = 0x8000_000f;
/// Interval of firmware driven recalibration on the ACX111.
const AUTO_RECALIB_INTERVAL_MS: u32 = 60_000;

pub const WEP_KEY_COUNT: u8 = 4;
pub const WEP_KEY_MAX_LEN: usize = 29;
const WEP_KEY_ADD: u8 = 1;
const WEP_KEY_REMOVE: u8 = 2;
const WEP_MGMT_LEN: usize = 45;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An error related to the device.
pub enum AcxError {
    Cmd(CmdError),
    Load(LoadError),
    /// A register read returned all ones. The card is gone.
    HardwareAbsent,
    /// The chip memory block pool can't hold the frame right now.
    TxBufferExhausted,
    /// The TX ring needed an emergency cleanup twice, without any progress in between.
    RingStuck,
    /// The queue gate is closed. Try again after the next wake.
    QueueStopped,
    /// The software TX FIFO is full.
    FifoFull,
    /// The frame is longer than [MAX_FRAME_LEN].
    FrameTooLong,
    /// The device wasn't brought up yet.
    NotStarted,
    InvalidChannel,
    /// The descriptor rings don't fit into the queue area of the device.
    RingLayout,
    InvalidConfig,
}
impl AcxError {
    /// Whether the device has to be reset and brought up again.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HardwareAbsent
                | Self::RingStuck
                | Self::Cmd(CmdError::FirmwareWedged)
                | Self::Load(
                    LoadError::FirmwareUploadFailed
                        | LoadError::InitTimeout
                        | LoadError::Command(CmdError::FirmwareWedged)
                )
        )
    }
}
impl From<CmdError> for AcxError {
    fn from(value: CmdError) -> Self {
        match value {
            CmdError::HardwareAbsent => Self::HardwareAbsent,
            err => Self::Cmd(err),
        }
    }
}
impl From<LoadError> for AcxError {
    fn from(value: LoadError) -> Self {
        match value {
            LoadError::HardwareAbsent | LoadError::Command(CmdError::HardwareAbsent) => {
                Self::HardwareAbsent
            }
            err => Self::Load(err),
        }
    }
}
pub type AcxResult<T> = Result<T, AcxError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Tunables of a device instance.
pub struct AcxConfig {
    /// The number of TX queues. Either one or two.
    pub tx_queues: usize,
    pub tx_ring_len: usize,
    pub rx_ring_len: usize,
    /// Close the queue gate, once fewer TX slots than this are free.
    pub tx_stop_queue: usize,
    /// Reopen the queue gate, once at least this many TX slots are free again.
    pub tx_start_queue: usize,
    /// A ring with fewer free slots, that doesn't make any progress, is considered stuck.
    pub tx_emergency_clean: usize,
    /// Capacity of the software TX FIFO.
    pub fifo_capacity: usize,
    pub cmd_timeout_ms: u32,
    /// Size of a chip memory block on slave memory cards.
    pub block_size: u32,
    pub default_channel: u8,
    /// Size of a host RX buffer on direct transports.
    pub rx_buf_size: usize,
}
impl Default for AcxConfig {
    fn default() -> Self {
        Self {
            tx_queues: 1,
            tx_ring_len: 32,
            rx_ring_len: 16,
            tx_stop_queue: 3,
            tx_start_queue: 6,
            tx_emergency_clean: 2,
            fifo_capacity: 64,
            cmd_timeout_ms: CMD_TIMEOUT_MS,
            block_size: 256,
            default_channel: 1,
            rx_buf_size: 2400,
        }
    }
}
impl AcxConfig {
    pub fn validate(&self) -> AcxResult<()> {
        let usable = self.tx_ring_len.saturating_sub(1);
        let valid = (1..=2).contains(&self.tx_queues)
            && (2..=u16::MAX as usize).contains(&self.tx_ring_len)
            && (1..=u16::MAX as usize).contains(&self.rx_ring_len)
            && self.tx_stop_queue < self.tx_start_queue
            && self.tx_start_queue <= usable
            && self.tx_emergency_clean <= usable
            && self.fifo_capacity != 0
            && self.cmd_timeout_ms != 0
            && self.block_size % BLOCK_ALIGN == 0
            && self.block_size > BLOCK_ALIGN
            && self.rx_buf_size != 0;
        if !valid {
            return Err(AcxError::InvalidConfig);
        }
        if !(1..=14).contains(&self.default_channel) {
            return Err(AcxError::InvalidChannel);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Counters kept by the device.
pub struct Stats {
    pub tx_frames: u32,
    pub tx_failures: u32,
    pub rx_frames: u32,
    pub tx_fragment_errors: u32,
    pub tx_aborts: u32,
    pub tx_bad_params: u32,
    pub tx_key_not_found: u32,
    pub tx_lifetime_exceeded: u32,
    pub tx_excessive_retries: u32,
    pub tx_buffer_overflows: u32,
    pub tx_dma_errors: u32,
    /// Frames, that had to wait, because the chip memory block pool was exhausted.
    pub tx_buffer_exhausted: u32,
    pub emergency_cleanups: u32,
    pub recalibrations: u32,
    pub recalibration_failures: u32,
}
impl Stats {
    /// Count and log every cause in the error byte.
    ///
    /// Returns whether the radio should be recalibrated.
    fn account_tx_error(&mut self, error: TxError) -> bool {
        if error.fragment() {
            self.tx_fragment_errors += 1;
            warn!("TX failed: a previous fragment failed.");
        }
        if error.aborted() {
            self.tx_aborts += 1;
            warn!("TX failed: aborted by the firmware.");
        }
        if error.bad_params() {
            self.tx_bad_params += 1;
            warn!("TX failed: invalid descriptor parameters.");
        }
        if error.key_not_found() {
            self.tx_key_not_found += 1;
            warn!("TX failed: no key for the receiver.");
        }
        if error.lifetime_exceeded() {
            self.tx_lifetime_exceeded += 1;
            warn!("TX failed: MSDU lifetime exceeded.");
        }
        if error.excessive_retries() {
            self.tx_excessive_retries += 1;
            warn!("TX failed: excessive retries, link quality poor or radio miscalibrated.");
        }
        if error.buffer_overflow() {
            self.tx_buffer_overflows += 1;
            warn!("TX failed: TX buffer overflow.");
        }
        if error.dma() {
            self.tx_dma_errors += 1;
            warn!("TX failed: DMA error.");
        }
        error.excessive_retries()
    }
}

/// The host MAC layer, as seen from the device.
///
/// All callbacks run in the service pass, while the device is locked. They must not call back
/// into the [Acx], except for [Acx::submit_frame] and [Acx::on_interrupt].
pub trait HostMac {
    fn on_frame_received(&mut self, frame: RxFrame);
    fn on_tx_status(&mut self, frame: TxFrame, status: TxStatus);
    fn on_scan_complete(&mut self) {}
    /// Stop handing us frames.
    fn stop_queue(&mut self) {}
    /// Frames are accepted again.
    fn wake_queue(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperatingMode {
    #[default]
    Managed,
    AdHoc,
    Master,
    /// Receive everything, including PHY header and FCS.
    Monitor,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Additional RX filter flags on top of the operating mode.
pub struct RxFilter {
    /// Don't filter on receiver address and BSSID.
    pub promiscuous: bool,
    pub all_multicast: bool,
    /// Pass up frames with a bad FCS.
    pub fcs_errors: bool,
}

/// The RXCONFIG IE for the mode and filter.
pub fn rx_config(mode: OperatingMode, filter: RxFilter) -> (RxConfig1, RxConfig2) {
    let mut config1 = RxConfig1::new().with_include_rxbuf_hdr(true);
    let mut config2 = RxConfig2::ALL;
    config1 = match mode {
        OperatingMode::Managed | OperatingMode::AdHoc => {
            config1.with_filter_bssid(true).with_filter_mac(true)
        }
        OperatingMode::Master => config1.with_filter_mac(true),
        OperatingMode::Monitor => config1
            .with_promiscuous(true)
            .with_include_fcs(true)
            .with_include_phy_hdr(true),
    };
    if filter.promiscuous {
        config1 = config1
            .with_promiscuous(true)
            .with_filter_bssid(false)
            .with_filter_mac(false);
    }
    if filter.all_multicast {
        config1 = config1.with_filter_all_multicast(true);
    }
    if filter.fcs_errors || mode == OperatingMode::Monitor {
        config2 = config2.with_broken(true);
    }
    (config1, config2)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Frame templates, the firmware sends on its own.
pub enum TemplateKind {
    Beacon,
    ProbeResponse,
    ProbeRequest,
    NullData,
    Tim,
}
impl TemplateKind {
    const fn cmd(self) -> CmdCode {
        match self {
            Self::Beacon => CmdCode::ConfigBeacon,
            Self::ProbeResponse => CmdCode::ConfigProbeResponse,
            Self::ProbeRequest => CmdCode::ConfigProbeRequest,
            Self::NullData => CmdCode::ConfigNullData,
            Self::Tim => CmdCode::ConfigTim,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    /// The number of scan rounds. Zero scans until stopped.
    pub count: u16,
    /// Only listen for beacons instead of sending probe requests.
    pub passive: bool,
    /// Time spent on each channel.
    pub channel_time_ms: u16,
    /// Rate for probe requests, passed through to the firmware.
    pub probe_rate: u8,
}
impl Default for ScanParams {
    fn default() -> Self {
        Self {
            count: 1,
            passive: false,
            channel_time_ms: 100,
            probe_rate: 0x14,
        }
    }
}
impl ScanParams {
    const LEN: usize = 12;

    fn encode(&self) -> [u8; Self::LEN] {
        let mut raw = [0u8; Self::LEN];
        raw[0..2].copy_from_slice(&self.count.to_le_bytes());
        // Start channel.
        raw[2..4].copy_from_slice(&1u16.to_le_bytes());
        let flags: u16 = if self.count == 0 { 0x8000 } else { 0 };
        raw[4..6].copy_from_slice(&flags.to_le_bytes());
        raw[6] = self.probe_rate;
        raw[7] = self.passive as u8;
        raw[8..10].copy_from_slice(&self.channel_time_ms.to_le_bytes());
        raw
    }
}

/// Keeps radio recalibration from running into a storm.
#[derive(Clone, Copy, Debug, Default)]
struct RecalibrationLimiter {
    last_attempt: Option<Instant>,
    failures: u8,
    suppressed_until: Option<Instant>,
}
impl RecalibrationLimiter {
    fn may_attempt(&self, now: Instant) -> bool {
        if self.suppressed_until.is_some_and(|until| now < until) {
            return false;
        }
        !self
            .last_attempt
            .is_some_and(|last| now.saturating_duration_since(last) < RECALIB_INTERVAL)
    }
    fn record(&mut self, now: Instant, success: bool) {
        self.last_attempt = Some(now);
        if success {
            self.failures = 0;
            self.suppressed_until = None;
            return;
        }
        self.failures += 1;
        if self.failures >= RECALIB_MAX_FAILURES {
            warn!(
                "Recalibration failed {} times in a row, suspending it for {} s.",
                self.failures,
                RECALIB_BACKOFF.as_secs()
            );
            self.failures = 0;
            self.suppressed_until = Some(now + RECALIB_BACKOFF);
        }
    }
}

/// Everything, that lives in device memory, once the device is up.
struct Rings {
    rx: RxRing,
    tx: Vec<TxRing>,
    /// Only present on slave memory cards. Shared by all TX rings.
    pool: Option<BlockAllocator>,
}
impl Rings {
    fn min_free(&self) -> usize {
        self.tx.iter().map(TxRing::free).min().unwrap_or(0)
    }
}

/// Hardware state, protected by the big device lock.
struct Hw<T: Transport> {
    transport: T,
    mailbox: Mailbox,
    rings: Option<Rings>,
    firmware_rev: Option<FirmwareRev>,
    channel: u8,
    mode: OperatingMode,
    filter: RxFilter,
    hw_encryption: bool,
    auto_recalibration: bool,
    recalibration: RecalibrationLimiter,
    /// Since when the TX ring is nearly full without making progress.
    tx_stall_since: Option<Instant>,
    /// An emergency cleanup happened and no frame completed since.
    emergency_pending: bool,
    stats: Stats,
}

/// An ACX100 or ACX111 WLAN device.
///
/// Operations, that touch the hardware, take the device lock for their entire duration. Only
/// [Acx::submit_frame] and [Acx::on_interrupt] don't, so they can be called from any context.
pub struct Acx<T: Transport> {
    hw: Mutex<DefaultRawMutex, Hw<T>>,
    tx_fifo: blocking_mutex::Mutex<DefaultRawMutex, RefCell<VecDeque<TxFrame>>>,
    irq: IrqSignal,
    irq_line: <T::Bus as RegisterBus>::IrqLine,
    gate: QueueGate,
    chip: ChipKind,
    config: AcxConfig,
}
impl<T: Transport> Acx<T> {
    /// Create a new device instance.
    ///
    /// Nothing is done with the hardware, until [Self::start] is called.
    pub fn new(transport: T, chip: ChipKind, config: AcxConfig) -> AcxResult<Self> {
        config.validate()?;
        trace!("Created device instance for {:?}.", chip);
        let irq_line = transport.irq_line();
        Ok(Self {
            hw: Mutex::new(Hw {
                transport,
                mailbox: Mailbox::new(),
                rings: None,
                firmware_rev: None,
                channel: config.default_channel,
                mode: OperatingMode::default(),
                filter: RxFilter::default(),
                hw_encryption: false,
                auto_recalibration: false,
                recalibration: RecalibrationLimiter::default(),
                tx_stall_since: None,
                emergency_pending: false,
                stats: Stats::default(),
            }),
            tx_fifo: blocking_mutex::Mutex::new(RefCell::new(VecDeque::new())),
            irq: IrqSignal::new(),
            irq_line,
            gate: QueueGate::new(config.tx_stop_queue, config.tx_start_queue),
            chip,
            config,
        })
    }
    pub const fn chip(&self) -> ChipKind {
        self.chip
    }
    pub const fn config(&self) -> &AcxConfig {
        &self.config
    }
    fn port<'a>(&'a self, hw: &'a mut Hw<T>) -> MailboxPort<'a, T> {
        MailboxPort {
            mailbox: &mut hw.mailbox,
            transport: &mut hw.transport,
            irq: &self.irq,
            chip: self.chip,
            timeout_ms: self.config.cmd_timeout_ms,
        }
    }
    /// Lock the device, if it's up.
    async fn started(&self) -> AcxResult<MutexGuard<'_, DefaultRawMutex, Hw<T>>> {
        let hw = self.hw.lock().await;
        if hw.rings.is_none() {
            return Err(AcxError::NotStarted);
        }
        Ok(hw)
    }

    /// Bring up the device.
    ///
    /// Resets the chip, loads the firmware and, if present, the radio module. Afterwards the
    /// descriptor rings are set up and RX and TX get enabled on the default channel.
    ///
    /// Calling this on a running device restarts it. Frames already on the rings are discarded
    /// without a TX status. Use [Self::stop] first, to have them reported. Frames still waiting
    /// in the software FIFO are kept and go out once the device is up again.
    pub async fn start(&self, firmware: &[u8], radio: Option<&[u8]>) -> AcxResult<()> {
        let firmware = FirmwareImage::parse(firmware)?;
        let radio = radio.map(FirmwareImage::parse).transpose()?;

        let mut guard = self.hw.lock().await;
        let hw = &mut *guard;
        let start_time = hw.transport.now();
        if hw.rings.take().is_some() {
            warn!("Restarting a running device.");
        }
        hw.mailbox.set_unloaded();
        hw.firmware_rev = None;

        reset_and_halt(&mut hw.transport).await;
        upload_image(&mut hw.transport, &firmware, 0).await?;
        start_ecpu(&mut hw.transport);
        wait_for_init(&mut hw.transport).await?;
        let cmd_area = hw.transport.read32(Reg::CmdMailboxOffs);
        if cmd_area == HW_ABSENT_32 {
            return Err(AcxError::HardwareAbsent);
        }
        hw.mailbox.set_loaded(cmd_area);

        let mut port = self.port(hw);
        let rev = FirmwareRev::read(&mut port).await?;
        info!(
            "Firmware {} running on hardware {:x}.",
            rev.version(),
            rev.hardware_id
        );
        upload_radio(&mut port, radio.as_ref()).await?;
        let map = MemoryMap::read(&mut port).await?;
        hw.firmware_rev = Some(rev);

        let rings = self.setup_rings(hw, &map).await?;
        hw.rings = Some(rings);
        hw.transport.write16(Reg::IrqMask, !IrqStatus::SERVICED.into_bits());

        hw.mode = OperatingMode::default();
        hw.filter = RxFilter::default();
        hw.hw_encryption = false;
        hw.tx_stall_since = None;
        hw.emergency_pending = false;
        let (mode, filter) = (hw.mode, hw.filter);
        self.apply_rx_config(hw, mode, filter).await?;
        let channel = self.config.default_channel;
        self.enable_radio(hw, channel).await?;
        hw.channel = channel;

        info!(
            "Device up after {} ms.",
            hw.transport.now().saturating_duration_since(start_time).as_millis()
        );
        Ok(())
    }
    /// Tell the firmware where the rings go and lay them out.
    async fn setup_rings(&self, hw: &mut Hw<T>, map: &MemoryMap) -> AcxResult<Rings> {
        let config = &self.config;
        let rx_base = map.queue_start;
        let mut end = rx_base + RxRing::size_bytes(config.rx_ring_len);
        let mut tx_bases = Vec::with_capacity(config.tx_queues);
        for _ in 0..config.tx_queues {
            tx_bases.push(end);
            end += TxRing::size_bytes(config.tx_ring_len);
        }
        if end > map.queue_end {
            error!(
                "Rings end at {:x}, but the queue area ends at {:x}.",
                end, map.queue_end
            );
            return Err(AcxError::RingLayout);
        }
        let slave_memory = matches!(T::KIND, TransportKind::SlaveMemory);
        // Room for the longest frame, plus a block lost to alignment.
        let pool_blocks = MAX_FRAME_LEN.div_ceil((config.block_size - LINK_SIZE) as usize) + 1;
        if slave_memory
            && map.pool_end.saturating_sub(map.pool_start) < config.block_size * pool_blocks as u32
        {
            error!(
                "Block pool {:x}..{:x} is too small.",
                map.pool_start, map.pool_end
            );
            return Err(AcxError::RingLayout);
        }

        let mut port = self.port(hw);
        if slave_memory && self.chip == ChipKind::Acx100 {
            ie::configure(
                &mut port,
                ids::BLOCK_SIZE,
                &(config.block_size as u16).to_le_bytes(),
            )
            .await?;
        }
        let queue_config = QueueConfig {
            rx_start: rx_base,
            rx_len: config.rx_ring_len as u16,
            tx: tx_bases
                .iter()
                .map(|base| (*base, config.tx_ring_len as u16))
                .collect(),
            queue_end: map.queue_end,
        };
        ie::configure(&mut port, ids::QUEUE_CONFIG, &queue_config.encode()).await?;
        let timeout_ms = port.timeout_ms();
        port.issue_cmd(CmdCode::InitMemory, &mut [], 0, timeout_ms)
            .await?;

        let transport = &mut hw.transport;
        let rx = RxRing::new(
            transport,
            self.chip,
            rx_base,
            config.rx_ring_len,
            config.rx_buf_size,
            matches!(T::KIND, TransportKind::DirectMmio),
        );
        let mut tx = Vec::with_capacity(config.tx_queues);
        for base in tx_bases {
            tx.push(TxRing::new(transport, self.chip, base, config.tx_ring_len));
        }
        let pool = slave_memory.then(|| {
            BlockAllocator::new(transport, map.pool_start, map.pool_end, config.block_size)
        });
        debug!(
            "Rings set up in {:x}..{:x}, {} TX queue(s).",
            rx_base, end, config.tx_queues
        );
        Ok(Rings { rx, tx, pool })
    }
    async fn enable_radio(&self, hw: &mut Hw<T>, channel: u8) -> CmdResult<()> {
        let mut port = self.port(hw);
        let timeout_ms = port.timeout_ms();
        port.issue_cmd(CmdCode::EnableTx, &mut [channel], 1, timeout_ms)
            .await?;
        port.issue_cmd(CmdCode::EnableRx, &mut [channel], 1, timeout_ms)
            .await?;
        debug!("Radio enabled on channel {}.", channel);
        Ok(())
    }
    async fn apply_rx_config(
        &self,
        hw: &mut Hw<T>,
        mode: OperatingMode,
        filter: RxFilter,
    ) -> CmdResult<()> {
        let (config1, config2) = rx_config(mode, filter);
        let mut payload = [0u8; 4];
        payload[0..2].copy_from_slice(&config1.into_bits().to_le_bytes());
        payload[2..4].copy_from_slice(&config2.into_bits().to_le_bytes());
        ie::configure(&mut self.port(hw), ids::RXCONFIG, &payload).await
    }

    /// Shut the device down.
    ///
    /// Frames still on the rings or in the FIFO are reported as dropped.
    pub async fn stop(&self, mac: &mut impl HostMac) -> AcxResult<()> {
        let mut guard = self.hw.lock().await;
        let hw = &mut *guard;
        let Some(mut rings) = hw.rings.take() else {
            return Ok(());
        };
        let mut port = self.port(hw);
        let timeout_ms = port.timeout_ms();
        let disabled = match port.issue_cmd(CmdCode::DisableTx, &mut [], 0, timeout_ms).await {
            Ok(()) => port.issue_cmd(CmdCode::DisableRx, &mut [], 0, timeout_ms).await,
            err => err,
        };
        // Mask everything.
        hw.transport.write16(Reg::IrqMask, u16::MAX);
        hw.transport.write16(Reg::EcpuCtrl, ECPU_CTRL_HALT);
        hw.mailbox.set_unloaded();
        for ring in rings.tx.iter_mut() {
            ring.emergency_reset(&mut hw.transport, |frame| {
                mac.on_tx_status(frame, TxStatus::dropped())
            });
        }
        while let Some(frame) = self.tx_fifo.lock(|fifo| fifo.borrow_mut().pop_front()) {
            mac.on_tx_status(frame, TxStatus::dropped());
        }
        info!("Device stopped.");
        disabled.map_err(AcxError::from)
    }

    /// Queue a frame for transmission.
    ///
    /// This never touches the hardware. If the frame isn't accepted, it's handed back.
    pub fn submit_frame(&self, frame: TxFrame) -> Result<(), (TxFrame, AcxError)> {
        if frame.data.len() > MAX_FRAME_LEN {
            return Err((frame, AcxError::FrameTooLong));
        }
        if self.gate.is_stopped() {
            return Err((frame, AcxError::QueueStopped));
        }
        let res = self.tx_fifo.lock(|fifo| {
            let mut fifo = fifo.borrow_mut();
            if fifo.len() >= self.config.fifo_capacity {
                return Err(frame);
            }
            fifo.push_back(frame);
            Ok(())
        });
        match res {
            Ok(()) => {
                self.irq.kick();
                Ok(())
            }
            Err(frame) => Err((frame, AcxError::FifoFull)),
        }
    }
    /// The frames waiting in the software FIFO.
    pub fn queued_frames(&self) -> usize {
        self.tx_fifo.lock(|fifo| fifo.borrow().len())
    }
    /// Whether the queue gate is closed.
    pub fn is_queue_stopped(&self) -> bool {
        self.gate.is_stopped()
    }
    /// Entry point for the interrupt handler.
    ///
    /// Masks all device interrupts and wakes the worker. `reasons` are the bits the platform
    /// already knows about, if any. The actual work is done by [Self::service], which unmasks
    /// again.
    pub fn on_interrupt(&self, reasons: IrqStatus) {
        self.irq_line.mask_all();
        self.irq.raise(reasons);
    }

    /// Do one round of deferred work.
    ///
    /// RX frames are delivered, completed TX slots are reclaimed and reported, the software FIFO
    /// is drained into the rings and the queue gate is updated.
    pub async fn service(&self, mac: &mut impl HostMac) -> AcxResult<()> {
        let mut guard = self.hw.lock().await;
        let hw = &mut *guard;
        if hw.rings.is_none() {
            return Ok(());
        }
        let raw = hw.transport.read16(Reg::IrqStatusNonDes);
        if raw == HW_ABSENT_16 {
            error!("Device vanished.");
            return Err(AcxError::HardwareAbsent);
        }
        if raw != 0 {
            hw.transport.write16(Reg::IrqAck, raw);
        }
        let reasons = IrqStatus::from_bits(raw | self.irq.take_all_observed().into_bits());
        trace!("Servicing interrupt reasons {:x}.", reasons.into_bits());
        if reasons.overflow() {
            warn!("RX overflow, frames were lost.");
        }
        if reasons.process_error() {
            warn!("Firmware reported a processing error.");
        }

        Self::deliver_rx(hw, mac);
        if self.reclaim_tx(hw, mac)? {
            self.maybe_recalibrate(hw).await?;
        }
        self.drain_fifo(hw, mac);

        if let Some(rings) = hw.rings.as_ref() {
            match self.gate.update(rings.min_free()) {
                Some(GateTransition::Stopped) => {
                    debug!("TX queue stopped, {} slots free.", rings.min_free());
                    mac.stop_queue();
                }
                Some(GateTransition::Woken) => {
                    debug!("TX queue woken, {} slots free.", rings.min_free());
                    mac.wake_queue();
                }
                None => {}
            }
        }
        if reasons.scan_complete() {
            debug!("Scan complete.");
            mac.on_scan_complete();
        }
        hw.transport.write16(Reg::IrqMask, !IrqStatus::SERVICED.into_bits());
        Ok(())
    }
    fn deliver_rx(hw: &mut Hw<T>, mac: &mut impl HostMac) {
        let Some(rings) = hw.rings.as_mut() else {
            return;
        };
        for frame in rings.rx.drain(&mut hw.transport) {
            hw.stats.rx_frames += 1;
            mac.on_frame_received(frame);
        }
    }
    /// Reclaim completed TX slots and detect stuck rings.
    ///
    /// Returns whether the radio should be recalibrated.
    fn reclaim_tx(&self, hw: &mut Hw<T>, mac: &mut impl HostMac) -> AcxResult<bool> {
        let Some(rings) = hw.rings.as_mut() else {
            return Ok(false);
        };
        let stats = &mut hw.stats;
        let mut recalibrate = false;
        let mut reclaimed = 0;
        for ring in rings.tx.iter_mut() {
            reclaimed += ring.clean(&mut hw.transport, rings.pool.as_mut(), |frame, status| {
                if status.success {
                    stats.tx_frames += 1;
                } else {
                    stats.tx_failures += 1;
                    recalibrate |= stats.account_tx_error(status.error);
                }
                mac.on_tx_status(frame, status);
            });
        }
        if reclaimed != 0 {
            hw.tx_stall_since = None;
            hw.emergency_pending = false;
            return Ok(recalibrate);
        }

        let starved = rings
            .tx
            .iter()
            .any(|ring| ring.outstanding() != 0 && ring.free() < self.config.tx_emergency_clean);
        if !starved {
            hw.tx_stall_since = None;
            return Ok(recalibrate);
        }
        let now = hw.transport.now();
        let since = *hw.tx_stall_since.get_or_insert(now);
        if now.saturating_duration_since(since) < Duration::from_millis(TX_STALL_TIMEOUT_MS) {
            return Ok(recalibrate);
        }

        error!(
            "TX stalled for {} ms, forcing all slots back. The firmware may be out of sync.",
            TX_STALL_TIMEOUT_MS
        );
        for ring in rings.tx.iter_mut() {
            ring.emergency_reset(&mut hw.transport, |frame| {
                mac.on_tx_status(frame, TxStatus::dropped())
            });
        }
        if let Some(pool) = rings.pool.as_mut() {
            pool.relink_all(&mut hw.transport);
        }
        stats.emergency_cleanups += 1;
        hw.tx_stall_since = None;
        if hw.emergency_pending {
            error!("Emergency cleanup recurred without progress, the device needs a reset.");
            return Err(AcxError::RingStuck);
        }
        hw.emergency_pending = true;
        Ok(recalibrate)
    }
    async fn maybe_recalibrate(&self, hw: &mut Hw<T>) -> AcxResult<()> {
        if hw.auto_recalibration {
            return Ok(());
        }
        let now = hw.transport.now();
        if !hw.recalibration.may_attempt(now) {
            debug!("Skipping recalibration, rate limited.");
            return Ok(());
        }
        hw.stats.recalibrations += 1;
        let res = self.recalibrate(hw).await;
        hw.recalibration.record(now, res.is_ok());
        match res {
            Ok(()) => {
                info!("Radio recalibrated.");
                Ok(())
            }
            Err(err) => {
                hw.stats.recalibration_failures += 1;
                warn!("Recalibration failed: {:?}", err);
                let err = AcxError::from(err);
                if err.is_fatal() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }
    async fn recalibrate(&self, hw: &mut Hw<T>) -> CmdResult<()> {
        match self.chip {
            ChipKind::Acx111 => {
                let mut params = radio_calib_params(0);
                let mut port = self.port(hw);
                let timeout_ms = port.timeout_ms();
                port.issue_cmd(CmdCode::RadioCalib, &mut params, RADIO_CALIB_LEN, timeout_ms)
                    .await
            }
            ChipKind::Acx100 => {
                let channel = hw.channel;
                self.enable_radio(hw, channel).await
            }
        }
    }
    /// Move frames from the software FIFO onto the rings, until one refuses.
    ///
    /// Frames, that can never be sent, are reported as failed instead of blocking the FIFO.
    fn drain_fifo(&self, hw: &mut Hw<T>, mac: &mut impl HostMac) {
        let Some(rings) = hw.rings.as_mut() else {
            return;
        };
        while let Some(frame) = self.tx_fifo.lock(|fifo| fifo.borrow_mut().pop_front()) {
            let queue = tx_queue_for(&frame, hw.hw_encryption, rings.tx.len());
            let res = rings.tx[queue].enqueue(
                &mut hw.transport,
                rings.pool.as_mut(),
                queue as u8,
                frame,
            );
            let Err((frame, refusal)) = res else {
                continue;
            };
            match refusal {
                TxRefusal::TooLong => {
                    warn!("Dropping a {} byte frame, it can't be sent.", frame.data.len());
                    hw.stats.tx_failures += 1;
                    mac.on_tx_status(frame, TxStatus::dropped());
                    continue;
                }
                TxRefusal::BufferExhausted => {
                    hw.stats.tx_buffer_exhausted += 1;
                    debug!("Out of chip memory blocks, frame stays queued.");
                }
                TxRefusal::RingFull => {}
            }
            self.tx_fifo.lock(|fifo| fifo.borrow_mut().push_front(frame));
            break;
        }
    }

    /// Wait for interrupts and service the device, until a fatal error occurs.
    pub async fn run(&self, mac: &mut impl HostMac) -> AcxError {
        loop {
            select(
                self.irq.wait(),
                Timer::after_millis(HOUSEKEEPING_INTERVAL_MS),
            )
            .await;
            match self.service(mac).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!("Giving up on the device: {:?}", err);
                    return err;
                }
                Err(err) => warn!("Service pass failed: {:?}", err),
            }
        }
    }

    /// Switch to a different channel.
    pub async fn set_channel(&self, channel: u8) -> AcxResult<()> {
        if !(1..=14).contains(&channel) {
            return Err(AcxError::InvalidChannel);
        }
        let mut hw = self.started().await?;
        self.enable_radio(&mut hw, channel).await?;
        hw.channel = channel;
        Ok(())
    }
    pub async fn channel(&self) -> u8 {
        self.hw.lock().await.channel
    }
    pub async fn set_mode(&self, mode: OperatingMode) -> AcxResult<()> {
        let mut hw = self.started().await?;
        let filter = hw.filter;
        self.apply_rx_config(&mut hw, mode, filter).await?;
        hw.mode = mode;
        debug!("Mode set to {:?}.", mode);
        Ok(())
    }
    pub async fn set_filter(&self, filter: RxFilter) -> AcxResult<()> {
        let mut hw = self.started().await?;
        let mode = hw.mode;
        self.apply_rx_config(&mut hw, mode, filter).await?;
        hw.filter = filter;
        Ok(())
    }
    /// Install a WEP default key and make it the one used for TX.
    ///
    /// This enables hardware encryption.
    pub async fn set_key(&self, index: u8, key: &[u8]) -> AcxResult<()> {
        if index >= WEP_KEY_COUNT || key.is_empty() || key.len() > WEP_KEY_MAX_LEN {
            return Err(AcxError::InvalidConfig);
        }
        let mut hw = self.started().await?;
        let mut port = self.port(&mut hw);
        write_wep_key(&mut port, WEP_KEY_ADD, index, key).await?;
        ie::configure(&mut port, ids::DOT11_WEP_DEFAULT_KEY_SET, &[index]).await?;
        hw.hw_encryption = true;
        debug!("WEP key {} installed.", index);
        Ok(())
    }
    /// Remove all WEP default keys and disable hardware encryption.
    pub async fn clear_keys(&self) -> AcxResult<()> {
        let mut hw = self.started().await?;
        let mut port = self.port(&mut hw);
        for index in 0..WEP_KEY_COUNT {
            write_wep_key(&mut port, WEP_KEY_REMOVE, index, &[]).await?;
        }
        hw.hw_encryption = false;
        Ok(())
    }
    pub async fn start_scan(&self, params: ScanParams) -> AcxResult<()> {
        let mut hw = self.started().await?;
        let mut raw = params.encode();
        let mut port = self.port(&mut hw);
        let timeout_ms = port.timeout_ms();
        port.issue_cmd(CmdCode::Scan, &mut raw, ScanParams::LEN, timeout_ms)
            .await?;
        debug!("Scan started.");
        Ok(())
    }
    pub async fn stop_scan(&self) -> AcxResult<()> {
        let mut hw = self.started().await?;
        let mut port = self.port(&mut hw);
        let timeout_ms = port.timeout_ms();
        port.issue_cmd(CmdCode::StopScan, &mut [], 0, timeout_ms)
            .await?;
        Ok(())
    }
    /// Upload a frame template. The content is passed through unmodified.
    pub async fn set_template(&self, kind: TemplateKind, template: &[u8]) -> AcxResult<()> {
        if template.len() + 2 > CMD_PARAM_MAX {
            return Err(AcxError::Cmd(CmdError::ParamTooLarge));
        }
        let mut raw = vec![0u8; template.len() + 2];
        raw[0..2].copy_from_slice(&(template.len() as u16).to_le_bytes());
        raw[2..].copy_from_slice(template);
        let mut hw = self.started().await?;
        let mut port = self.port(&mut hw);
        let timeout_ms = port.timeout_ms();
        let len = raw.len();
        port.issue_cmd(kind.cmd(), &mut raw, len, timeout_ms).await?;
        Ok(())
    }
    pub async fn set_tx_power(&self, level: u8) -> AcxResult<()> {
        let mut hw = self.started().await?;
        ie::configure(&mut self.port(&mut hw), ids::DOT11_TX_POWER_LEVEL, &[level]).await?;
        Ok(())
    }
    /// Let the firmware recalibrate the radio on its own.
    ///
    /// Only the ACX111 can do this. While enabled, no recalibration is triggered by TX errors.
    pub async fn set_auto_recalibration(&self, enabled: bool) -> AcxResult<()> {
        let mut hw = self.started().await?;
        if self.chip == ChipKind::Acx111 {
            let interval = if enabled { AUTO_RECALIB_INTERVAL_MS } else { 0 };
            let mut params = radio_calib_params(interval);
            let mut port = self.port(&mut hw);
            let timeout_ms = port.timeout_ms();
            port.issue_cmd(CmdCode::RadioCalib, &mut params, RADIO_CALIB_LEN, timeout_ms)
                .await?;
        } else if enabled {
            return Err(AcxError::InvalidConfig);
        }
        hw.auto_recalibration = enabled;
        Ok(())
    }
    /// Write a raw IE.
    pub async fn configure(&self, id: u16, payload: &[u8]) -> AcxResult<()> {
        let mut hw = self.hw.lock().await;
        ie::configure(&mut self.port(&mut hw), id, payload).await?;
        Ok(())
    }
    /// Read a raw IE. Returns the number of bytes written to `out`.
    pub async fn interrogate(&self, id: u16, out: &mut [u8]) -> AcxResult<usize> {
        let mut hw = self.hw.lock().await;
        Ok(ie::interrogate(&mut self.port(&mut hw), id, out).await?)
    }
    /// Issue a raw command.
    pub async fn issue_command(&self, cmd: CmdCode, buf: &mut [u8], len: usize) -> AcxResult<()> {
        let mut hw = self.hw.lock().await;
        let timeout_ms = self.config.cmd_timeout_ms;
        self.port(&mut hw)
            .issue_cmd(cmd, buf, len, timeout_ms)
            .await?;
        Ok(())
    }
    pub async fn stats(&self) -> Stats {
        self.hw.lock().await.stats
    }
    pub async fn firmware_rev(&self) -> Option<FirmwareRev> {
        self.hw.lock().await.firmware_rev
    }
}

/// Pick the TX queue for a frame.
///
/// With two queues and hardware encryption enabled, protected frames go to the second one.
fn tx_queue_for(frame: &TxFrame, hw_encryption: bool, queues: usize) -> usize {
    if queues > 1 && hw_encryption && is_protected(&frame.data) {
        1
    } else {
        0
    }
}

const RADIO_CALIB_LEN: usize = 8;

fn radio_calib_params(interval_ms: u32) -> [u8; RADIO_CALIB_LEN] {
    let mut params = [0u8; RADIO_CALIB_LEN];
    params[0..4].copy_from_slice(&RADIO_CALIB_METHODS.to_le_bytes());
    params[4..8].copy_from_slice(&interval_ms.to_le_bytes());
    params
}

/// Add or remove a WEP default key.
///
/// The ACX100 takes keys through an IE, the ACX111 has a dedicated command with a different
/// layout.
async fn write_wep_key<P: CommandPort>(
    port: &mut P,
    action: u8,
    index: u8,
    key: &[u8],
) -> CmdResult<()> {
    match port.chip() {
        ChipKind::Acx100 => {
            let mut payload = [0u8; 3 + WEP_KEY_MAX_LEN];
            payload[0] = action;
            payload[1] = key.len() as u8;
            payload[2] = index;
            payload[3..3 + key.len()].copy_from_slice(key);
            ie::configure(port, ids::DOT11_WEP_DEFAULT_KEY_WRITE, &payload).await
        }
        ChipKind::Acx111 => {
            // Action, key size, key type, index, reserved, MAC address, key.
            let mut params = [0u8; WEP_MGMT_LEN];
            params[0..2].copy_from_slice(&(action as u16).to_le_bytes());
            params[2..4].copy_from_slice(&(key.len() as u16).to_le_bytes());
            params[5] = index;
            params[13..13 + key.len()].copy_from_slice(key);
            let timeout_ms = port.timeout_ms();
            port.issue_cmd(CmdCode::WepMgmt, &mut params, WEP_MGMT_LEN, timeout_ms)
                .await
        }
    }
}

#[cfg(test)]
impl<T: Transport> Acx<T> {
    async fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.hw.lock().await.transport)
    }
    async fn tx_desc_addr(&self, queue: usize, index: usize) -> u32 {
        let hw = self.hw.lock().await;
        hw.rings.as_ref().map_or(0, |rings| rings.tx[queue].desc_addr(index))
    }
    async fn rx_desc_addr(&self, index: usize) -> u32 {
        let hw = self.hw.lock().await;
        hw.rings.as_ref().map_or(0, |rings| rings.rx.desc_addr(index))
    }
    async fn tx_outstanding(&self) -> Vec<usize> {
        let hw = self.hw.lock().await;
        hw.rings
            .as_ref()
            .map(|rings| rings.tx.iter().map(TxRing::outstanding).collect())
            .unwrap_or_default()
    }
    async fn pool_free_blocks(&self) -> Option<usize> {
        let hw = self.hw.lock().await;
        hw.rings
            .as_ref()
            .and_then(|rings| rings.pool.as_ref())
            .map(BlockAllocator::free_blocks)
    }
}
