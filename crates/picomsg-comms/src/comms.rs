use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::config::{CommsConfig, Noise, Role, SayLevel, Stats};
use crate::connection::{Backing, Connection, SendPolicy};
use crate::error::SendError;
use crate::hub::Hub;
use crate::message::Message;
use crate::status::Status;

/// User handle on one end of a link.
///
/// Dropping the handle closes the connection: queued messages are still
/// flushed by a worker (bounded by the close grace), followed by a goodbye.
pub struct Comms {
    conn: Arc<Connection>,
    hub: Hub,
}

impl Comms {
    pub(crate) fn new(conn: Arc<Connection>, hub: Hub) -> Self {
        Self { conn, hub }
    }

    /// Queue `data` as one message.
    ///
    /// An empty message or one above the largest message size is a protocol
    /// violation: the connection closes (`EILSEQ` / `EDOM`).
    pub fn send(&self, data: &[u8], policy: SendPolicy) -> Result<(), SendError> {
        self.conn.queue_send(data, policy)
    }

    /// Queue `text` followed by a NUL byte.
    pub fn send_str(&self, text: &str, policy: SendPolicy) -> Result<(), SendError> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.conn.queue_send(&data, policy)
    }

    /// Next message, waiting up to `timeout`. `Duration::ZERO` only polls.
    ///
    /// Returns `None` on timeout, or at once when the read side has closed
    /// and every delivered message has been collected.
    pub fn get(&self, timeout: Duration) -> Option<Message> {
        self.conn.get(timeout)
    }

    /// [`Self::get`] bounded by the configured send timeout.
    pub fn get_default(&self) -> Option<Message> {
        let timeout = self.conn.config().send_timeout;
        self.conn.get(timeout)
    }

    /// Start closing. Idempotent; messages already received stay readable.
    pub fn close(&self, reason: &str) {
        self.conn.request_close(reason);
    }

    pub fn status(&self) -> Option<Status> {
        self.conn.status()
    }

    /// The status as an errno, `0` while open.
    pub fn error_code(&self) -> i32 {
        self.status().map_or(0, Status::errno)
    }

    pub fn is_closing(&self) -> bool {
        self.conn.is_closing()
    }

    /// Reclaimed by a worker: nothing more will be sent or received.
    pub fn is_closed(&self) -> bool {
        self.conn.is_fully_closed()
    }

    /// Queued bytes have not all left yet.
    pub fn is_still_sending(&self) -> bool {
        self.conn.is_still_sending()
    }

    pub fn config(&self) -> CommsConfig {
        self.conn.config()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.conn.update_config(|config| config.name = name);
    }

    pub fn name(&self) -> String {
        self.conn.config().name
    }

    pub fn set_noise(&self, noise: Noise) {
        self.conn.set_noise(noise);
    }

    /// Adjust any other setting. A new largest message applies to both
    /// directions; the ring size class stays as allocated.
    pub fn reconfigure(&self, f: impl FnOnce(&mut CommsConfig)) {
        self.conn.update_config(f);
    }

    pub fn stats(&self) -> Stats {
        self.conn.stats()
    }

    /// Emit a diagnostic through the say sink, whatever the noise mask.
    pub fn say(&self, what: &str) {
        self.conn.say(SayLevel::Always, what, "", None);
    }

    pub fn role(&self) -> Role {
        self.conn.role()
    }

    pub fn is_thread_mode(&self) -> bool {
        self.conn.backing() == Backing::Shared
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

impl Drop for Comms {
    fn drop(&mut self) {
        if !self.conn.is_valid() {
            error!(id = self.conn.id(), "dropping handle on a reclaimed connection");
            return;
        }
        self.conn.request_close("handle dropped");
    }
}

impl std::fmt::Debug for Comms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comms").field("conn", &self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, Weak};
    use std::time::Instant;

    use super::*;
    use crate::config::{HubConfig, SayEvent};

    fn quiet() -> CommsConfig {
        CommsConfig::default().with_noise(Noise::SILENT)
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn send_str_adds_nul() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, child) = hub.init_pair(&quiet()).unwrap();

        parent.send_str("mary had a little lamb", SendPolicy::CanTimeOut).unwrap();
        let msg = child.get_default().unwrap();
        assert_eq!(msg.len(), 23);
        assert_eq!(msg.as_str(), Some("mary had a little lamb"));
    }

    #[test]
    fn destroy_with_unflushed_bytes_reclaims_once() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, child) = hub.init_pair(&quiet()).unwrap();
        for i in 0..64u8 {
            parent.send(&[i; 512], SendPolicy::CanTimeOut).unwrap();
        }
        let weak: Weak<Connection> = Arc::downgrade(&parent.conn);
        drop(parent);

        assert!(wait_for(|| weak.upgrade().is_none()));
        assert_eq!(hub.connections(), 1);

        // Everything queued before the drop still arrives, in order.
        for i in 0..64u8 {
            let msg = child.get(Duration::from_secs(5)).unwrap();
            assert_eq!(msg.as_bytes(), &[i; 512]);
        }
        assert!(child.get(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn close_is_idempotent_and_keeps_received_messages() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, child) = hub.init_pair(&quiet()).unwrap();
        parent.send(b"kept", SendPolicy::CanTimeOut).unwrap();
        assert!(wait_for(|| child.stats().total_received == 1));

        child.close("first");
        child.close("second");
        assert_eq!(child.status(), Some(Status::NotConnected));
        assert_eq!(child.error_code(), libc::ENOTCONN);
        assert_eq!(child.get(Duration::ZERO).unwrap().as_bytes(), b"kept");
        assert!(matches!(
            child.send(b"late", SendPolicy::GiveUp),
            Err(SendError::Closed(Some(Status::NotConnected)))
        ));
    }

    #[test]
    fn peer_get_ends_after_close() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, child) = hub.init_pair(&quiet()).unwrap();
        parent.close("bye");

        let start = Instant::now();
        assert!(child.get(Duration::from_secs(10)).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(child.status(), None);
    }

    #[test]
    fn explicit_say_ignores_noise() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |event: &SayEvent<'_>| {
                seen.lock().unwrap().push(format!("{}:{}", event.name, event.what));
            }
        };
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, _child) = hub.init_pair(&quiet().with_say(sink)).unwrap();

        parent.say("hello");
        parent.set_name("Query");
        parent.say("renamed");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Parent:hello".to_string(), "Query:renamed".to_string()]
        );
    }

    #[test]
    fn lifecycle_events_follow_the_noise_mask() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |event: &SayEvent<'_>| {
                seen.lock().unwrap().push((event.role, event.what.to_string()));
            }
        };
        let hub = Hub::new(HubConfig::default()).unwrap();
        let config = quiet().with_noise(Noise::EVENTS_PARENT).with_say(sink);
        let (parent, child) = hub.init_pair(&config).unwrap();
        child.close("quiet side");
        parent.close("loud side");

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(role, _)| *role == Role::Parent));
        assert!(seen.iter().any(|(_, what)| what == "Started"));
        assert!(seen.iter().any(|(_, what)| what == "Closing"));
    }

    #[test]
    fn raised_largest_msg_is_honoured_by_the_receiver() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let config = quiet().with_ring_size_bits(14).with_largest_msg(1024);
        let (parent, child) = hub.init_pair(&config).unwrap();
        parent.reconfigure(|c| c.frame.max_payload_size = 4096);
        child.reconfigure(|c| c.frame.max_payload_size = 4096);

        parent.send(&[5u8; 2000], SendPolicy::CanTimeOut).unwrap();
        let msg = child.get(Duration::from_secs(5)).expect("message above the old limit");
        assert_eq!(msg.as_bytes(), &[5u8; 2000][..]);
        assert_eq!(child.status(), None);
        assert_eq!(child.config().largest_msg(), 4096);
    }

    #[test]
    fn reconfigure_keeps_the_allocated_ring_size() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, _child) = hub.init_pair(&quiet().with_ring_size_bits(12)).unwrap();
        parent.reconfigure(|c| c.frame.ring_size_bits = 20);
        assert_eq!(parent.config().frame.ring_size_bits, 12);
    }

    #[test]
    fn thread_mode_handles_report_it() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let (parent, worker) = hub
            .init_thread(&quiet(), |comms| comms.is_thread_mode())
            .unwrap();
        assert!(parent.is_thread_mode());
        assert!(worker.join().unwrap());
    }
}
