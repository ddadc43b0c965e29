use super::{ClientInner, HandshakeStage};
use crate::constants::{HEARTBEAT_TICKET, LONG_TICK_TICKET, PING_SMOOTHING_FACTOR, PING_TICKET};
use crate::proto::events::ErrorInfo;
use crate::proto::packet_crafter::keep_alive::{Ping, Pong};
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::security::SendOptions;
use crate::proto::timer_queue::{TimerQueueHandle, TimerResult};
use lan_io::tokio::time::Instant;
use lan_types::errors::ErrorType;
use lan_types::proto::{ClientSettings, HostId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

impl ClientInner {
    pub(super) fn register_timers(timers: &TimerQueueHandle<ClientInner>, settings: &ClientSettings) {
        timers.insert_periodic(HEARTBEAT_TICKET, settings.heartbeat_interval, |client| {
            client.on_heartbeat()
        });
        timers.insert_periodic(LONG_TICK_TICKET, settings.long_tick_interval, |client| {
            client.on_long_tick()
        });
        timers.insert_periodic(PING_TICKET, settings.ping_interval, |client| {
            client.on_ping_tick()
        });
    }

    /// Notices a silent server and keeps the send queues moving
    fn on_heartbeat(self: &Arc<Self>) -> TimerResult {
        if self.terminated.load(Ordering::Acquire) {
            return TimerResult::EndSession;
        }

        let (joined, idle_timeout) = {
            let session = self.session.lock();
            (session.stage == HandshakeStage::Joined, session.idle_timeout)
        };
        if !joined {
            return TimerResult::Incomplete;
        }

        if !idle_timeout.is_zero() && self.server.last_recv().elapsed() >= idle_timeout {
            log::warn!(target: "lan", "No traffic from the server for {idle_timeout:?}");
            self.record_leave_reason(ErrorType::ConnectionTimeout, Default::default());
            self.server.close();
            return TimerResult::Incomplete;
        }

        if self.server.queued_bytes() > 0 {
            self.server.issue_send();
        }

        let direct_links = self.peers.lock().direct_links();
        for (_, link) in direct_links {
            if link.queued_bytes() > 0 {
                link.issue_send();
            }
        }

        TimerResult::Incomplete
    }

    fn on_long_tick(self: &Arc<Self>) -> TimerResult {
        if self.terminated.load(Ordering::Acquire) {
            return TimerResult::EndSession;
        }

        let capacity = self.settings.send_queue_warning_capacity;
        let mut links = vec![(HostId::SERVER, self.server.clone())];
        links.extend(self.peers.lock().direct_links());

        for (host_id, link) in links {
            let report = link.long_tick(capacity);
            if report.dropped_frames > 0 {
                log::trace!(target: "lan", "Dropped {} stale unreliable frames ({} bytes) for {host_id}", report.dropped_frames, report.dropped_bytes);
            }

            if report.over_capacity {
                self.raise_warning(ErrorInfo::new(
                    ErrorType::SendQueueOverload,
                    host_id,
                    format!(
                        "Send queue towards {host_id} holds {} bytes",
                        link.queued_bytes()
                    ),
                ));
            }
        }

        TimerResult::Incomplete
    }

    /// Pings the server and every direct link
    fn on_ping_tick(self: &Arc<Self>) -> TimerResult {
        if self.terminated.load(Ordering::Acquire) {
            return TimerResult::EndSession;
        }
        if !self.is_joined() {
            return TimerResult::Incomplete;
        }

        let recent_ping_us = self
            .ping
            .lock()
            .server_ping
            .map(|ping| ping.as_micros() as u64)
            .unwrap_or(0);
        let ping = Ping {
            sent_at_us: self.local_time_us(),
            recent_ping_us,
        }
        .craft();

        if let Err(err) = self.server.send(&ping, SendOptions::UNRELIABLE) {
            log::trace!(target: "lan", "Unable to ping the server: {err}");
        }

        let direct_links = self.peers.lock().direct_links();
        for (peer_id, link) in direct_links {
            if let Err(err) = link.send(&ping, SendOptions::UNRELIABLE) {
                log::trace!(target: "lan", "Unable to ping {peer_id}: {err}");
            }
        }

        TimerResult::Incomplete
    }

    pub(super) fn on_server_pong(&self, pong: Pong) {
        let round_trip = self.round_trip_since(pong.sent_at_us);
        let one_way = round_trip / 2;
        let server_now = Duration::from_millis(pong.responder_time_ms) + one_way;

        let mut ping = self.ping.lock();
        ping.server_ping = Some(smooth(ping.server_ping, one_way));
        ping.server_clock = Some((server_now, Instant::now()));
    }

    pub(super) fn on_peer_pong(&self, peer_id: HostId, pong: Pong) {
        let one_way = self.round_trip_since(pong.sent_at_us) / 2;
        let mut peers = self.peers.lock();
        let previous = peers.recent_ping(peer_id);
        peers.set_recent_ping(peer_id, smooth(previous, one_way));
    }

    fn round_trip_since(&self, sent_at_us: u64) -> Duration {
        Duration::from_micros(self.local_time_us().saturating_sub(sent_at_us))
    }
}

/// Exponential moving average of latency samples
fn smooth(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        None => sample,
        Some(previous) => {
            previous.mul_f64(1.0 - PING_SMOOTHING_FACTOR) + sample.mul_f64(PING_SMOOTHING_FACTOR)
        }
    }
}
