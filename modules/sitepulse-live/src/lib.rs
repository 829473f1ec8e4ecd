//! Live event fan-out: per-(organization, project) pub/sub of log and
//! job-update events, mirrored across process instances through a broker
//! channel, delivered to WebSocket subscribers.

mod broker;
mod bus;
mod ws;

pub use broker::{channel_name, parse_channel, BrokerMessage, EventBroker, LocalBroker, PgBroker};
pub use bus::{BusEvent, EventBus, SendBuffer, StatsUpdate};
pub use ws::{router, AuthedUser, Authenticator, WsState};
