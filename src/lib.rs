//! MQTT Tracer Library
//!
//! Time-bounded, topic-scoped capture of MQTT traffic into a local trace
//! store. The [`tracer`] engine subscribes through a [`mqtt::BrokerClient`],
//! persists every message inside its window through [`store::TraceStore`] and
//! counts matches per filter; [`headless`] drives one trace from the command
//! line.

pub mod cli;
pub mod error;
pub mod headless;
pub mod lock;
pub mod message;
pub mod mqtt;
pub mod paths;
pub mod profile;
pub mod registry;
pub mod store;
pub mod topics;
pub mod tracer;
pub mod util;
