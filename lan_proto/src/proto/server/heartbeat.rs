use super::ServerInner;
use crate::constants::{HEARTBEAT_TICKET, LONG_TICK_TICKET};
use crate::proto::events::ErrorInfo;
use crate::proto::peer::PeerState;
use crate::proto::timer_queue::{TimerQueueHandle, TimerResult};
use bytes::Bytes;
use lan_io::tokio::time::Instant;
use lan_types::errors::ErrorType;
use lan_types::proto::{HostId, ServerSettings};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl ServerInner {
    pub(super) fn register_timers(timers: &TimerQueueHandle<ServerInner>, settings: &ServerSettings) {
        timers.insert_periodic(HEARTBEAT_TICKET, settings.heartbeat_interval, |server| {
            server.on_heartbeat()
        });
        timers.insert_periodic(LONG_TICK_TICKET, settings.long_tick_interval, |server| {
            server.on_long_tick()
        });
    }

    /// Timeouts, ack expiry and the disposal sweep
    fn on_heartbeat(self: &Arc<Self>) -> TimerResult {
        if self.terminated.load(Ordering::Acquire) {
            return TimerResult::EndSession;
        }

        let now = Instant::now();
        let settings = self.settings.clone();
        let clients = self
            .run_group_op(|registry| {
                let expired = registry.expire_ack_waiters(now, settings.ack_wait_timeout);
                Ok((registry.all(), expired))
            })
            .unwrap_or_default();

        for client in clients {
            match client.state() {
                PeerState::Candidate
                    if now.saturating_duration_since(client.created_at())
                        >= settings.candidate_timeout =>
                {
                    log::trace!(target: "lan", "{:?} did not finish its handshake in time", client.link());
                    let _ = self.dispose_client(
                        &client,
                        ErrorType::AuthenticationTimeout,
                        ErrorType::Ok,
                        Bytes::new(),
                    );
                }

                PeerState::Authenticated
                    if now.saturating_duration_since(client.link().last_recv())
                        >= settings.default_timeout =>
                {
                    log::trace!(target: "lan", "{:?} went idle", client.link());
                    let _ = self.dispose_client(
                        &client,
                        ErrorType::ConnectionTimeout,
                        ErrorType::Ok,
                        Bytes::new(),
                    );
                }

                PeerState::Authenticated if client.link().queued_bytes() > 0 => {
                    client.link().issue_send()
                }

                _ => {}
            }
        }

        self.sweep_disposed(now, settings.graceful_shutdown_timeout);
        TimerResult::Incomplete
    }

    /// Ages the send queues and warns about the ones over capacity
    fn on_long_tick(self: &Arc<Self>) -> TimerResult {
        if self.terminated.load(Ordering::Acquire) {
            return TimerResult::EndSession;
        }

        let capacity = self.settings.send_queue_warning_capacity;
        let clients = self.registry.lock().all();
        for client in clients {
            let report = client.link().long_tick(capacity);
            if report.dropped_frames > 0 {
                log::trace!(target: "lan", "Dropped {} stale unreliable frames ({} bytes) for {:?}", report.dropped_frames, report.dropped_bytes, client.link());
            }

            if report.over_capacity {
                let host_id = client.host_id().unwrap_or(HostId::NONE);
                self.raise_warning(ErrorInfo::new(
                    ErrorType::SendQueueOverload,
                    host_id,
                    format!(
                        "Send queue of {host_id} holds {} bytes",
                        client.link().queued_bytes()
                    ),
                ));
            }
        }

        TimerResult::Incomplete
    }
}
