//! Core enums and small value types shared across the crate.

/// Lifecycle states of the HCI router's state machine.
///
/// The transition table lives on [`HalState::can_transition_to`]. Any
/// state can transition to `Shutdown`; all other transitions are
/// restricted to the sequence a chip actually goes through during
/// bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalState {
    Shutdown,
    Init,
    PreFirmwareDownload,
    FirmwareDownloading,
    FirmwareDownloadCompleted,
    FirmwareReady,
    BtChipReady,
    Running,
}

impl HalState {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: HalState) -> bool {
        use HalState::*;

        if next == Shutdown {
            return true;
        }

        matches!(
            (self, next),
            (Shutdown, Init)
                | (Init, PreFirmwareDownload)
                | (PreFirmwareDownload, FirmwareDownloading)
                | (FirmwareDownloading, FirmwareDownloadCompleted)
                | (FirmwareDownloadCompleted, FirmwareReady)
                | (FirmwareReady, BtChipReady)
                | (BtChipReady, Running)
                | (Running, BtChipReady)
        )
    }

    /// Position in the bring-up sequence, used only to answer "is this
    /// state at or past `BtChipReady`/`Running`" questions — not a
    /// general ordering over arbitrary pairs of states, since the
    /// machine is not a strict total order (`Shutdown` is reachable
    /// from anywhere).
    fn rank(self) -> u8 {
        match self {
            HalState::Shutdown => 0,
            HalState::Init => 1,
            HalState::PreFirmwareDownload => 2,
            HalState::FirmwareDownloading => 3,
            HalState::FirmwareDownloadCompleted => 4,
            HalState::FirmwareReady => 5,
            HalState::BtChipReady => 6,
            HalState::Running => 7,
        }
    }

    pub fn is_chip_ready(self) -> bool {
        self.rank() >= HalState::BtChipReady.rank()
    }

    pub fn is_bluetooth_enabled(self) -> bool {
        self.rank() >= HalState::Running.rank()
    }
}

/// The H4 packet type indicator, the first byte of every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Command,
    Acl,
    Sco,
    Event,
    Iso,
    ThreadData,
}

impl PacketType {
    pub fn from_indicator(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(PacketType::Command),
            0x02 => Some(PacketType::Acl),
            0x03 => Some(PacketType::Sco),
            0x04 => Some(PacketType::Event),
            0x05 => Some(PacketType::Iso),
            0x70 => Some(PacketType::ThreadData),
            _ => None,
        }
    }

    pub fn indicator(self) -> u8 {
        match self {
            PacketType::Command => 0x01,
            PacketType::Acl => 0x02,
            PacketType::Sco => 0x03,
            PacketType::Event => 0x04,
            PacketType::Iso => 0x05,
            PacketType::ThreadData => 0x70,
        }
    }

    /// Length of the fixed preamble that follows the type indicator byte,
    /// not counting the indicator itself.
    pub fn preamble_len(self) -> usize {
        match self {
            PacketType::Command => 3,
            PacketType::Acl => 4,
            PacketType::Sco => 3,
            PacketType::Event => 2,
            PacketType::Iso => 4,
            PacketType::ThreadData => 4,
        }
    }
}

/// HCI event codes the rescuer and router care about by name.
///
/// Not an exhaustive enum of the Core Spec's event table — only the
/// codes this crate's rescue/dispatch logic inspects directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    CommandComplete,
    CommandStatus,
    ConnectionComplete,
    ConnectionRequest,
    DisconnectionComplete,
    ReadRemoteVersionInformationComplete,
    QosSetupComplete,
    RoleChange,
    ModeChange,
    LinkKeyRequest,
    MaxSlotsChange,
    ReadRemoteExtendedFeaturesComplete,
    SniffSubrating,
    EncryptionKeyRefreshComplete,
    LinkSupervisionTimeoutChanged,
    EnhancedFlushComplete,
    NumberOfCompletedPackets,
    BleMeta,
    VendorSpecific,
    Other(u8),
}

impl EventCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x0e => EventCode::CommandComplete,
            0x0f => EventCode::CommandStatus,
            0x03 => EventCode::ConnectionComplete,
            0x04 => EventCode::ConnectionRequest,
            0x05 => EventCode::DisconnectionComplete,
            0x0c => EventCode::ReadRemoteVersionInformationComplete,
            0x0d => EventCode::QosSetupComplete,
            0x12 => EventCode::RoleChange,
            0x14 => EventCode::ModeChange,
            0x17 => EventCode::LinkKeyRequest,
            0x1b => EventCode::MaxSlotsChange,
            0x23 => EventCode::ReadRemoteExtendedFeaturesComplete,
            0x2e => EventCode::SniffSubrating,
            0x30 => EventCode::EncryptionKeyRefreshComplete,
            0x38 => EventCode::LinkSupervisionTimeoutChanged,
            0x39 => EventCode::EnhancedFlushComplete,
            0x13 => EventCode::NumberOfCompletedPackets,
            0x3e => EventCode::BleMeta,
            0xff => EventCode::VendorSpecific,
            other => EventCode::Other(other),
        }
    }

    /// Fixed parameter length for events whose length the rescuer can
    /// predict from the event code alone. `None` means the code either
    /// has a variable-length body or the rescuer has no table entry
    /// for it (vendor-specific events fall in the latter camp).
    pub fn fixed_param_len(self) -> Option<usize> {
        match self {
            EventCode::CommandStatus => Some(4),
            EventCode::ConnectionComplete => Some(0x0B),
            EventCode::ConnectionRequest => Some(0x0A),
            EventCode::DisconnectionComplete => Some(4),
            EventCode::ReadRemoteVersionInformationComplete => Some(8),
            EventCode::QosSetupComplete => Some(0x15),
            EventCode::RoleChange => Some(8),
            EventCode::ModeChange => Some(6),
            EventCode::LinkKeyRequest => Some(6),
            EventCode::MaxSlotsChange => Some(3),
            EventCode::ReadRemoteExtendedFeaturesComplete => Some(0x0d),
            EventCode::SniffSubrating => Some(0x0b),
            EventCode::EncryptionKeyRefreshComplete => Some(3),
            EventCode::LinkSupervisionTimeoutChanged => Some(4),
            EventCode::EnhancedFlushComplete => Some(2),
            _ => None,
        }
    }
}

/// Sources that can hold a reference on the process wakelock.
///
/// Every source also has its own watchdog budget; see
/// [`crate::power::watchdog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeSource {
    Tx,
    Rx,
    HciBusy,
    RouterTask,
    Transport,
    Initialize,
    Close,
}

impl WakeSource {
    pub const ALL: [WakeSource; 7] = [
        WakeSource::Tx,
        WakeSource::Rx,
        WakeSource::HciBusy,
        WakeSource::RouterTask,
        WakeSource::Transport,
        WakeSource::Initialize,
        WakeSource::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WakeSource::Tx => "Tx",
            WakeSource::Rx => "Rx",
            WakeSource::HciBusy => "HciBusy",
            WakeSource::RouterTask => "RouterTask",
            WakeSource::Transport => "Transport",
            WakeSource::Initialize => "Initialize",
            WakeSource::Close => "Close",
        }
    }
}

/// How much of the non-command traffic a registered client wants to see.
///
/// Ordered `None < Monitor < Intercept`; when more than one client is
/// registered, the aggregate mode for a packet is the maximum over all
/// clients that asked to see it (see [`crate::router::monitor`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MonitorMode {
    None,
    Monitor,
    Intercept,
}

impl MonitorMode {
    pub fn aggregate(modes: impl IntoIterator<Item = MonitorMode>) -> MonitorMode {
        modes.into_iter().max().unwrap_or(MonitorMode::None)
    }
}

/// HCI command opcodes this crate needs to recognize by name.
pub mod opcodes {
    /// Vendor "debug info" command; the controller never emits a
    /// command-complete/status event for it, so it bypasses the
    /// flow-control queue entirely.
    pub const GOOGLE_DEBUG_INFO: u16 = 0xfc00;
}
