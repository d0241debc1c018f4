//! evio — a layered, event-driven I/O runtime.
//!
//! The crate multiplexes heterogeneous I/O objects (TCP with DNS-aware
//! Happy-Eyeballs connecting, pipes, HID devices, OS wakeup handles, and
//! timers) onto one or more cooperatively scheduled event loops, delivering
//! state-change notifications to callbacks with strict per-object ordering.
//! A full IANA/POSIX-TZ timezone engine backs all wall-clock work.
//!
//! # Quick start
//!
//! ```no_run
//! use evio::event::{Event, EventFlags, EventType, TIMEOUT_INF};
//! use evio::io::net::{self, NetType};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event = Event::create(EventFlags::NONE)?;
//!
//!     let server = net::server_create(0, None, NetType::Any)?;
//!     let port = net::get_port(&server);
//!     println!("listening on port {}", port);
//!
//!     event.add(&server, move |_ev, ty, io| {
//!         if ty == EventType::Accept {
//!             if let Ok(client) = io.accept() {
//!                 println!("accepted {:?}", net::get_ipaddr(&client));
//!                 client.destroy();
//!             }
//!         }
//!     });
//!
//!     event.run(TIMEOUT_INF);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`event`] — event loops, per-core pools, timers, soft events.
//! - [`io`] — I/O objects as stacks of composable [`io::Layer`]s; concrete
//!   TCP, DNS-connector, pipe, OS-event and HID layers.
//! - [`dns`] — the asynchronous resolver with query and Happy-Eyeballs
//!   caches.
//! - [`time`] — clock primitives and the timezone engine.

#![warn(missing_debug_implementations)]

mod sys;

pub mod dns;
pub mod error;
pub mod event;
pub mod io;
pub mod time;
pub mod util;

pub use error::{IoError, TzError};
