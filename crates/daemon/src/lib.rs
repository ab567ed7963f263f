//! # Wirelift Daemon
//!
//! Upgrades a relayed Tailscale link between two hosts into a direct
//! peer-to-peer WireGuard tunnel, and recovers that tunnel when it
//! degrades.
//!
//! ## Key Components
//!
//! ### Negotiation
//! - [`Daemon`] - dual-listener runtime dispatching one worker per session
//! - [`Message`] - the wire vocabulary and payload builders
//! - [`Session`] - per-negotiation context, retrievable by the running worker
//!
//! ### Control Plane
//! - [`tailscale`] - adapter over the externally running tailscale agent
//! - [`locker`] - host-wide critical-section lock around its command surface
//!
//! ### Tunnel
//! - [`WgConfig`] - template parsing, runtime config generation, wg-quick
//! - [`systemd`] - unit lifecycle and the transient idle-teardown units

pub mod channel;
pub mod client;
pub mod config;
pub mod daemon;
pub mod locker;
pub mod messages;
pub mod recover;
pub mod session;
pub mod systemd;
pub mod tailscale;
pub mod upgrade;
pub mod wgconfig;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{DaemonSettings, Settings, TimingSettings, UpgradeSettings};

// ============================================================================
// Messages
// ============================================================================

pub use messages::{ActionCode, ErrorCode, ErrorReport, Message, SessionExit};

// ============================================================================
// Runtime
// ============================================================================

pub use channel::Channel;
pub use daemon::{Daemon, Shutdown};
pub use session::Session;

// ============================================================================
// Tunnel Configuration
// ============================================================================

pub use wgconfig::{IpNet, UpgradeOutput, WgConfig};
