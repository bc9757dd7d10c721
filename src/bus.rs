//! Message bus plumbing: topics, the publish connection and the
//! subscription feeder thread.
//!
//! Publishing and subscribing use separate connections so a blocked
//! subscription read can never delay a publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use redis::Commands;
use serde_json::Value;

use crate::error::Result;

pub const TOPIC_HOPPER_REQUEST: &str = "hopper-request";
pub const TOPIC_VALIDATOR_REQUEST: &str = "validator-request";
/// Reserved topic; subscribed, but no behavior is attached.
pub const TOPIC_METACASH: &str = "metacash";
pub const TOPIC_HOPPER_RESPONSE: &str = "hopper-response";
pub const TOPIC_VALIDATOR_RESPONSE: &str = "validator-response";
pub const TOPIC_HOPPER_EVENT: &str = "hopper-event";
pub const TOPIC_VALIDATOR_EVENT: &str = "validator-event";
pub const TOPIC_PAYOUT_EVENT: &str = "payout-event";

fn connection_url(host: &str, port: u16) -> String {
    format!("redis://{host}:{port}/")
}

/// The daemon's publishing end of the bus.
pub struct BusPublisher {
    connection: redis::Connection,
}

impl BusPublisher {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(connection_url(host, port))?;
        let connection = client.get_connection()?;
        Ok(Self { connection })
    }

    /// Publishes one JSON document to `topic`.
    pub fn publish(&mut self, topic: &str, document: &Value) -> Result<()> {
        let payload = document.to_string();
        log::debug!("publishing to '{topic}': {payload}");
        self.connection.publish::<_, _, ()>(topic, payload)?;
        Ok(())
    }
}

/// One message received from a request topic.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Subscribes to the request topics and feeds incoming messages into a
/// channel the event loop selects on.
///
/// The feeder thread owns the subscribe connection and polls it with a short
/// read timeout so it can observe the shutdown flag; it never touches
/// hardware or publishes anything.
pub fn spawn_subscriber(
    host: &str,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> Result<(mpsc::Receiver<BusMessage>, thread::JoinHandle<()>)> {
    let client = redis::Client::open(connection_url(host, port))?;
    // connect up-front so a dead bus fails startup instead of a thread
    let mut connection = client.get_connection()?;

    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let mut pubsub = connection.as_pubsub();

        if let Err(err) =
            pubsub.subscribe(&[TOPIC_HOPPER_REQUEST, TOPIC_VALIDATOR_REQUEST, TOPIC_METACASH])
        {
            log::error!("could not subscribe to request topics: {err}");
            return;
        }
        if let Err(err) = pubsub.set_read_timeout(Some(Duration::from_millis(250))) {
            log::error!("could not configure subscription read timeout: {err}");
            return;
        }

        while !shutdown.load(Ordering::Relaxed) {
            let message = match pubsub.get_message() {
                Ok(message) => message,
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    log::error!("bus subscription failed: {err}");
                    break;
                }
            };

            let topic = message.get_channel_name().to_string();
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    log::warn!("discarding non-text message on '{topic}': {err}");
                    continue;
                }
            };

            if tx.send(BusMessage { topic, payload }).is_err() {
                break;
            }
        }
    });

    Ok((rx, handle))
}
