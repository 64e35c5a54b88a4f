//! Card request worker — turns card application requests from RabbitMQ into
//! an approval notification and a card-generation call.

pub mod app;
pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod provisioning;
