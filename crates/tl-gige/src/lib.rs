#![cfg_attr(docsrs, feature(doc_cfg))]
//! GigE Vision TL: discovery (GVCP), control (GenCP/GVCP), streaming (GVSP).

pub mod action;
pub mod buffer;
pub mod consts;
pub mod control;
pub mod device;
pub mod gvcp;
pub mod gvsp;
pub mod heartbeat;
pub mod message;
pub mod nic;
pub mod pool;
pub mod psize;
pub mod stats;
pub mod stream;
pub mod time;

pub use consts::GVCP_PORT;
pub use device::{DeviceError, GigeDevice};
pub use gvcp::{discover, discover_on_interface, DeviceInfo};
