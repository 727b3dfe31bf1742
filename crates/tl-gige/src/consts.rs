//! Well-known GigE Vision register offsets and protocol-wide constants.
//!
//! Offsets come from the GigE Vision specification bootstrap register map;
//! addresses below `0x0900` are standard across every compliant device.

use std::time::Duration;

/// GVCP control port as defined by the GigE Vision specification (section 7.3).
pub const GVCP_PORT: u16 = 3956;

/// Maximum bytes carried in one `READ_MEMORY`/`WRITE_MEMORY` fragment.
///
/// Kept conservative (under the smallest GVCP packet a compliant device must
/// accept) so block operations never need to probe for a working size.
pub const DATA_SIZE_MAX: usize = 540;

/// Default control-transaction timeout before the first retry.
pub const GVCP_TIMEOUT_MS: u64 = 1000;
/// Default control-transaction timeout as a [`Duration`].
pub const GVCP_TIMEOUT: Duration = Duration::from_millis(GVCP_TIMEOUT_MS);
/// Number of retries attempted after the initial request (3 total attempts).
pub const N_RETRIES: u32 = 2;

/// Default heartbeat period once control has been acquired.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);
/// Upper bound on how long a single heartbeat read may be retried before the
/// task gives up on that cycle (but keeps monitoring on the next one).
pub const HEARTBEAT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of pooled receive buffers used by the portable GVSP backend.
pub const NUM_BUFFERS: usize = 32;

/// Frame ids within this many steps behind the most recent are "late" rather
/// than "new", per spec.md §3 ("Invariants").
pub const LATE_FRAME_THRESHOLD: i64 = 100;

/// Default fraction of a frame's expected packet count that may be spent on
/// resend requests before the frame gives up on recovery.
pub const PACKET_REQUEST_RATIO: f64 = 0.25;
/// Default deadline given to a packet before it becomes resend-eligible on
/// its first observed absence.
pub const INITIAL_PACKET_TIMEOUT: Duration = Duration::from_micros(20_000);
/// Default deadline given to a packet after a resend has been requested for it.
pub const PACKET_TIMEOUT: Duration = Duration::from_micros(40_000);
/// Default time since the last received packet before an in-flight frame is
/// abandoned as timed out.
pub const FRAME_RETENTION: Duration = Duration::from_micros(200_000);
/// Upper bound on how long the receiver blocks waiting for a datagram before
/// running the idle frame-completion sweep.
pub const STREAM_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Bootstrap register: current IP configuration mode bits.
pub const REG_CURRENT_IP_CONFIG: u64 = 0x0014;
/// Bootstrap register: current IPv4 address.
pub const REG_CURRENT_IP: u64 = 0x0024;
/// Bootstrap register: current subnet mask.
pub const REG_CURRENT_SUBNET: u64 = 0x0034;
/// Bootstrap register: current default gateway.
pub const REG_CURRENT_GATEWAY: u64 = 0x0044;

/// Bootstrap register: `DeviceVendorName` (32 bytes, read-only).
pub const REG_VENDOR_NAME: u64 = 0x0048;
/// Length in bytes of [`REG_VENDOR_NAME`].
pub const LEN_VENDOR_NAME: usize = 32;
/// Bootstrap register: `DeviceModelName` (32 bytes).
pub const REG_MODEL_NAME: u64 = 0x0068;
/// Length in bytes of [`REG_MODEL_NAME`].
pub const LEN_MODEL_NAME: usize = 32;
/// Bootstrap register: `DeviceVersion` (32 bytes).
pub const REG_DEVICE_VERSION: u64 = 0x0088;
/// Length in bytes of [`REG_DEVICE_VERSION`].
pub const LEN_DEVICE_VERSION: usize = 32;
/// Bootstrap register: `DeviceManufacturerInfo` (48 bytes).
pub const REG_MANUFACTURER_INFO: u64 = 0x00A8;
/// Length in bytes of [`REG_MANUFACTURER_INFO`].
pub const LEN_MANUFACTURER_INFO: usize = 48;
/// Bootstrap register: `DeviceID` / serial number (16 bytes).
pub const REG_DEVICE_ID: u64 = 0x00D8;
/// Length in bytes of [`REG_DEVICE_ID`].
pub const LEN_DEVICE_ID: usize = 16;

/// Bootstrap register: persistent IPv4 address.
pub const REG_PERSISTENT_IP: u64 = 0x064C;
/// Bootstrap register: persistent subnet mask.
pub const REG_PERSISTENT_SUBNET: u64 = 0x065C;
/// Bootstrap register: persistent default gateway.
pub const REG_PERSISTENT_GATEWAY: u64 = 0x066C;

/// Bootstrap register: device mode (endianness and device class bits).
pub const REG_DEVICE_MODE: u64 = 0x0004;
/// Bit within [`REG_DEVICE_MODE`] set when the device's register/memory
/// space is big-endian rather than the mandated little-endian default.
pub const DEVICE_MODE_BIG_ENDIAN_BIT: u32 = 1 << 31;

/// Bootstrap register: GVCP capability flags.
pub const REG_GVCP_CAPABILITY: u64 = 0x0934;
/// Bit within [`REG_GVCP_CAPABILITY`] reporting `PACKETRESEND_CMD` support.
pub const GVCP_CAPABILITY_PACKET_RESEND_BIT: u32 = 1 << 13;
/// Bit within [`REG_GVCP_CAPABILITY`] reporting `WRITEMEM_CMD` support.
pub const GVCP_CAPABILITY_WRITE_MEMORY_BIT: u32 = 1 << 16;

/// Bootstrap register: number of stream channels the device exposes.
pub const REG_STREAM_CHANNEL_COUNT: u64 = 0x0904;

/// Bootstrap register: message (event) channel host port (upper 16 bits).
pub const REG_MESSAGE_CHANNEL_PORT: u64 = 0x0B00;
/// Bootstrap register: message channel destination IPv4 address.
pub const REG_MESSAGE_CHANNEL_DEST_IP: u64 = 0x0B10;
/// Base of the vendor-defined per-event enable bits following the message
/// channel block.
pub const MESSAGE_CHANNEL_EVENT_ENABLE_BASE: u64 = 0x0B20;

/// Bootstrap register: high 32 bits of the timestamp tick frequency.
pub const REG_TIMESTAMP_TICK_FREQUENCY_HIGH: u64 = 0x093C;
/// Bootstrap register: low 32 bits of the timestamp tick frequency.
pub const REG_TIMESTAMP_TICK_FREQUENCY_LOW: u64 = 0x0940;

/// Well-known control-channel-privilege register (`GevCCP`).
pub const REG_CONTROL_CHANNEL_PRIVILEGE: u64 = 0x0A00;
/// Bit requesting exclusive/primary control of the device.
pub const CCP_CONTROL_BIT: u32 = 0x0000_0002;
/// Bit reporting that some other host already holds exclusive control.
pub const CCP_EXCLUSIVE_BIT: u32 = 0x0000_0001;

/// Base address of the per-channel stream configuration block.
pub const STREAM_CHANNEL_BASE: u64 = 0x0D00;
/// Stride in bytes between successive stream channel blocks.
pub const STREAM_CHANNEL_STRIDE: u64 = 0x40;
/// Offset within a stream channel block: host destination UDP port
/// (upper 16 bits of the register).
pub const SC_OFFSET_DEST_PORT: u64 = 0x00;
/// Offset within a stream channel block: packet size and control flags.
pub const SC_OFFSET_PACKET_SIZE: u64 = 0x04;
/// Bit within the packet-size register requesting a `FireTestPacket`.
pub const SCPS_FIRE_TEST_PACKET_BIT: u32 = 0x0000_0001;
/// Bit within the packet-size register disabling IP fragmentation.
pub const SCPS_DO_NOT_FRAGMENT_BIT: u32 = 0x0000_0002;
/// Bit within the packet-size register selecting big-endian GVSP payloads.
pub const SCPS_BIG_ENDIAN_BIT: u32 = 0x0000_0004;
/// Offset within a stream channel block: packet delay (timestamp ticks).
pub const SC_OFFSET_PACKET_DELAY: u64 = 0x08;
/// Offset within a stream channel block: host destination IPv4 address.
pub const SC_OFFSET_DEST_IP: u64 = 0x18;
/// Offset within a stream channel block: source stream UDP port (read-only).
pub const SC_OFFSET_SOURCE_PORT: u64 = 0x1C;
/// Offset within a stream channel block: multipart configuration (bit 25).
pub const SC_OFFSET_MULTIPART: u64 = 0x24;
/// Bit enabling multipart payloads within [`SC_OFFSET_MULTIPART`].
pub const SCMP_ENABLE_BIT: u32 = 1 << 25;

/// Address of a stream channel register.
pub const fn stream_channel_reg(channel: u32, offset: u64) -> u64 {
    STREAM_CHANNEL_BASE + channel as u64 * STREAM_CHANNEL_STRIDE + offset
}
