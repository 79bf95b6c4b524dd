//! OSDP (Open Supervised Device Protocol) access control unit bus stack.
//!
//! A `ControlPanel` owns a set of independent `Bus` instances, each driving
//! one `Connection` and a roster of `DeviceProxy`s addressed 0..=127. Every
//! `Bus` runs its own cooperative poll loop: per cycle it picks the next
//! device round-robin, sends that device's next outbound frame, waits out a
//! per-device reply window, and hands the decoded reply to the
//! process-wide `ReplyDispatcher`, which correlates it against whichever
//! caller is awaiting it (if any) and fans it out to typed listeners.
//!
//! Byte-level encoding of individual command/reply *payloads*, the AES-128
//! CBC confidentiality transform itself, the physical transport, and the
//! caller-facing typed command helpers are all external collaborators,
//! specified only at the boundaries this crate exposes (`Connection`,
//! `Command`, `Reply`).
//!
//! ```no_run
//! # async fn demo(connection: Box<dyn osdp_acu::Connection>) -> osdp_acu::Result<()> {
//! use osdp_acu::{Address, Command, CommandCode, ControlPanel};
//!
//! let panel = ControlPanel::new();
//! let conn = panel.start_connection(connection, None);
//! let address = Address::new(1).unwrap();
//! panel.add_device(conn, address, false, false, None).await?;
//!
//! let reply = panel
//!     .send_command(conn, Command::new(address, CommandCode::IdReport, vec![]), None, None)
//!     .await?;
//! println!("{:?}", reply.kind);
//! # Ok(())
//! # }
//! ```

mod bus;
pub mod command;
pub mod config;
pub mod connection;
pub mod control_panel;
pub mod device;
mod dispatcher;
pub mod error;
mod frame;
mod piv;
mod secure_channel;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use command::{Command, CommandCode, Reply, ReplyKind, TransactionId};
pub use config::BusConfig;
pub use connection::{Connection, ConnectionId, ReadOutcome};
pub use control_panel::{CancelSignal, ControlPanel};
pub use device::{Address, AddressOutOfRange, BROADCAST};
pub use error::{Error, Result};
