//! Connection supervisor: the only owner of [`ConnectionState`].
//!
//! The state machine itself performs no I/O. Each transition returns a
//! [`Directive`] that the engine carries out (start a session, arm a
//! timer, flush the queue, stop the process). Timer firings come back
//! tagged with the epoch or token they were armed for, so a firing that
//! lost a race with a newer transition is ignored.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    parley_channels::{CloseReason, ConnectionUpdate, SendError, Transport},
    parley_common::{ConversationId, OutboundPayload},
    parley_config::ConnectionConfig,
    serde::Serialize,
    tokio::time::Instant,
    tracing::{info, warn},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingPairing { token: String, issued_at: Instant },
    Connected,
    /// Terminal. A restart with fresh pairing is required.
    LoggedOut,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingPairing { .. } => "awaiting_pairing",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
        }
    }
}

/// Why the supervisor gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    LoggedOut,
    AttemptsExhausted { attempts: u32 },
}

/// Work the engine must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    None,
    /// Start (or restart) a transport session now.
    Connect,
    /// Deliver `on_reconnect_due(epoch)` after `after`.
    ScheduleReconnect { after: Duration, epoch: u64 },
    /// Deliver `on_pairing_expired(token)` after `after`.
    ArmPairingExpiry { token: String, after: Duration },
    /// The session is live: flush pending replies after the settle delay.
    Connected { epoch: u64 },
    Fatal(Fatal),
}

/// Answer to an operator reconnect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectRequest {
    Initiated(Directive),
    AlreadyConnected,
    LoggedOut,
}

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: &'static str,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug)]
struct Machine {
    state: ConnectionState,
    attempts: u32,
    epoch: u64,
    user: Option<String>,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    machine: Mutex<Machine>,
    max_attempts: u32,
    reconnect_delay: Duration,
    pairing_ttl: Duration,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, config: &ConnectionConfig) -> Self {
        Self {
            transport,
            machine: Mutex::new(Machine {
                state: ConnectionState::Disconnected,
                attempts: 0,
                epoch: 0,
                user: None,
            }),
            max_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            pairing_ttl: config.pairing_ttl(),
        }
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.machine().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.machine().state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.machine().attempts
    }

    /// Current pairing token, if one is waiting to be scanned.
    pub fn pairing_token(&self) -> Option<String> {
        match &self.machine().state {
            ConnectionState::AwaitingPairing { token, .. } => Some(token.clone()),
            _ => None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let machine = self.machine();
        ConnectionStatus {
            state: machine.state.label(),
            connected: machine.state == ConnectionState::Connected,
            reconnect_attempts: machine.attempts,
            max_reconnect_attempts: self.max_attempts,
            user: machine.user.clone(),
        }
    }

    /// Send through the live session. Never waits for a reconnect.
    pub async fn send(
        &self,
        to: &ConversationId,
        payload: &OutboundPayload,
    ) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.transport.send(to, payload).await
    }

    /// `Disconnected -> Connecting`.
    pub fn start(&self) -> Directive {
        let mut machine = self.machine();
        match machine.state {
            ConnectionState::Disconnected => {
                machine.state = ConnectionState::Connecting;
                info!(attempt = machine.attempts + 1, "connecting");
                Directive::Connect
            },
            _ => Directive::None,
        }
    }

    /// Apply a transport-reported change.
    pub fn on_update(&self, update: &ConnectionUpdate) -> Directive {
        let mut machine = self.machine();
        if machine.state == ConnectionState::LoggedOut {
            return Directive::None;
        }

        match update {
            ConnectionUpdate::Connecting => {
                machine.state = ConnectionState::Connecting;
                Directive::None
            },
            ConnectionUpdate::PairingRequired { token } => {
                info!("pairing required, waiting for QR scan");
                machine.state = ConnectionState::AwaitingPairing {
                    token: token.clone(),
                    issued_at: Instant::now(),
                };
                Directive::ArmPairingExpiry {
                    token: token.clone(),
                    after: self.pairing_ttl,
                }
            },
            ConnectionUpdate::Open { user } => {
                machine.state = ConnectionState::Connected;
                machine.attempts = 0;
                machine.epoch += 1;
                machine.user = user.clone();
                info!(user = user.as_deref().unwrap_or("unknown"), "connected");
                Directive::Connected {
                    epoch: machine.epoch,
                }
            },
            ConnectionUpdate::Closed {
                reason: CloseReason::LoggedOut,
            } => {
                warn!("logged out, re-pairing required");
                machine.state = ConnectionState::LoggedOut;
                machine.user = None;
                Directive::Fatal(Fatal::LoggedOut)
            },
            ConnectionUpdate::Closed {
                reason: CloseReason::Recoverable { message, status },
            } => {
                machine.user = None;
                machine.attempts += 1;
                machine.epoch += 1;
                if machine.attempts > self.max_attempts {
                    warn!(attempts = machine.attempts, "reconnect attempts exhausted");
                    machine.state = ConnectionState::LoggedOut;
                    return Directive::Fatal(Fatal::AttemptsExhausted {
                        attempts: machine.attempts - 1,
                    });
                }
                warn!(
                    reason = %message,
                    status = ?status,
                    attempt = machine.attempts,
                    max_attempts = self.max_attempts,
                    delay_ms = self.reconnect_delay.as_millis() as u64,
                    "connection closed, reconnecting"
                );
                machine.state = ConnectionState::Connecting;
                Directive::ScheduleReconnect {
                    after: self.reconnect_delay,
                    epoch: machine.epoch,
                }
            },
        }
    }

    /// A start attempt failed before the transport reported anything.
    pub fn on_connect_failed(&self, message: &str) -> Directive {
        self.on_update(&ConnectionUpdate::Closed {
            reason: CloseReason::recoverable(message),
        })
    }

    /// The reconnect delay armed for `epoch` elapsed.
    pub fn on_reconnect_due(&self, epoch: u64) -> Directive {
        let machine = self.machine();
        if machine.epoch != epoch || machine.state != ConnectionState::Connecting {
            return Directive::None;
        }
        info!(attempt = machine.attempts, max_attempts = self.max_attempts, "reconnecting");
        Directive::Connect
    }

    /// The pairing token armed earlier expired. Re-issue if it is still the
    /// current one.
    pub fn on_pairing_expired(&self, token: &str) -> Directive {
        let mut machine = self.machine();
        match &machine.state {
            ConnectionState::AwaitingPairing { token: current, .. } if current == token => {
                info!("pairing token expired, requesting a new one");
                machine.state = ConnectionState::Connecting;
                Directive::Connect
            },
            _ => Directive::None,
        }
    }

    /// Whether a settle timer armed for `epoch` still belongs to the live
    /// session.
    pub fn is_current_session(&self, epoch: u64) -> bool {
        let machine = self.machine();
        machine.epoch == epoch && machine.state == ConnectionState::Connected
    }

    /// Operator-triggered reconnect. Resets the attempt counter.
    pub fn request_reconnect(&self) -> ReconnectRequest {
        let mut machine = self.machine();
        match machine.state {
            ConnectionState::Connected => ReconnectRequest::AlreadyConnected,
            ConnectionState::LoggedOut => ReconnectRequest::LoggedOut,
            _ => {
                machine.attempts = 0;
                machine.epoch += 1;
                machine.state = ConnectionState::Connecting;
                info!("manual reconnect requested");
                ReconnectRequest::Initiated(Directive::Connect)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, parley_channels::testing::MockTransport};

    fn supervisor(max_attempts: u32) -> (ConnectionSupervisor, Arc<MockTransport>) {
        let (transport, _rx) = MockTransport::new();
        let config = ConnectionConfig {
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: max_attempts,
            pairing_ttl_secs: 60,
        };
        (ConnectionSupervisor::new(transport.clone(), &config), transport)
    }

    fn closed() -> ConnectionUpdate {
        ConnectionUpdate::Closed {
            reason: CloseReason::recoverable("stream errored"),
        }
    }

    fn open() -> ConnectionUpdate {
        ConnectionUpdate::Open {
            user: Some("15550000000".into()),
        }
    }

    #[test]
    fn start_only_from_disconnected() {
        let (sup, _) = supervisor(10);
        assert_eq!(sup.start(), Directive::Connect);
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.start(), Directive::None);
    }

    #[test]
    fn open_resets_attempts() {
        let (sup, _) = supervisor(10);
        sup.start();
        sup.on_update(&closed());
        sup.on_update(&closed());
        assert_eq!(sup.attempts(), 2);
        assert!(matches!(sup.on_update(&open()), Directive::Connected { .. }));
        assert_eq!(sup.attempts(), 0);
        assert!(sup.is_connected());
        assert_eq!(sup.status().user.as_deref(), Some("15550000000"));
    }

    #[test]
    fn recoverable_close_schedules_reconnect() {
        let (sup, _) = supervisor(10);
        sup.start();
        sup.on_update(&open());
        let Directive::ScheduleReconnect { after, epoch } = sup.on_update(&closed()) else {
            panic!("expected reconnect");
        };
        assert_eq!(after, Duration::from_secs(5));
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.on_reconnect_due(epoch), Directive::Connect);
        assert_eq!(sup.on_reconnect_due(epoch - 1), Directive::None);
    }

    #[test]
    fn reconnect_timer_is_stale_once_connected() {
        let (sup, _) = supervisor(10);
        sup.start();
        let Directive::ScheduleReconnect { epoch, .. } = sup.on_update(&closed()) else {
            panic!("expected reconnect");
        };
        sup.on_update(&open());
        assert_eq!(sup.on_reconnect_due(epoch), Directive::None);
    }

    #[test]
    fn exceeding_max_attempts_is_fatal() {
        let (sup, _) = supervisor(2);
        sup.start();
        assert!(matches!(sup.on_update(&closed()), Directive::ScheduleReconnect { .. }));
        assert!(matches!(sup.on_update(&closed()), Directive::ScheduleReconnect { .. }));
        assert_eq!(
            sup.on_update(&closed()),
            Directive::Fatal(Fatal::AttemptsExhausted { attempts: 2 })
        );
        assert_eq!(sup.state(), ConnectionState::LoggedOut);
        assert_eq!(sup.on_update(&open()), Directive::None);
    }

    #[test]
    fn logged_out_is_terminal() {
        let (sup, _) = supervisor(10);
        sup.start();
        sup.on_update(&open());
        assert_eq!(
            sup.on_update(&ConnectionUpdate::Closed {
                reason: CloseReason::LoggedOut
            }),
            Directive::Fatal(Fatal::LoggedOut)
        );
        assert_eq!(sup.request_reconnect(), ReconnectRequest::LoggedOut);
    }

    #[test]
    fn pairing_expiry_reissues_only_current_token() {
        let (sup, _) = supervisor(10);
        sup.start();
        let directive = sup.on_update(&ConnectionUpdate::PairingRequired {
            token: "qr-1".into(),
        });
        assert_eq!(directive, Directive::ArmPairingExpiry {
            token: "qr-1".into(),
            after: Duration::from_secs(60),
        });
        assert_eq!(sup.pairing_token().as_deref(), Some("qr-1"));

        sup.on_update(&ConnectionUpdate::PairingRequired {
            token: "qr-2".into(),
        });
        assert_eq!(sup.on_pairing_expired("qr-1"), Directive::None);
        assert_eq!(sup.on_pairing_expired("qr-2"), Directive::Connect);
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.pairing_token(), None);
    }

    #[test]
    fn paired_session_moves_back_to_connecting() {
        let (sup, _) = supervisor(10);
        sup.start();
        sup.on_update(&ConnectionUpdate::PairingRequired {
            token: "qr".into(),
        });
        sup.on_update(&ConnectionUpdate::Connecting);
        assert_eq!(sup.state(), ConnectionState::Connecting);
    }

    #[test]
    fn manual_reconnect() {
        let (sup, _) = supervisor(10);
        sup.start();
        sup.on_update(&closed());
        assert_eq!(
            sup.request_reconnect(),
            ReconnectRequest::Initiated(Directive::Connect)
        );
        assert_eq!(sup.attempts(), 0);
        sup.on_update(&open());
        assert_eq!(sup.request_reconnect(), ReconnectRequest::AlreadyConnected);
    }

    #[tokio::test]
    async fn send_requires_live_session() {
        let (sup, transport) = supervisor(10);
        let to = ConversationId::new("1@s.whatsapp.net");
        let err = sup.send(&to, &OutboundPayload::text("hi")).await.unwrap_err();
        assert!(err.is_disconnected());
        assert!(transport.sent().is_empty());

        sup.start();
        sup.on_update(&open());
        sup.send(&to, &OutboundPayload::text("hi")).await.unwrap();
        assert_eq!(transport.sent_texts(), vec!["hi"]);
    }

    #[test]
    fn settle_epoch_tracks_session() {
        let (sup, _) = supervisor(10);
        sup.start();
        let Directive::Connected { epoch } = sup.on_update(&open()) else {
            panic!("expected connected");
        };
        assert!(sup.is_current_session(epoch));
        sup.on_update(&closed());
        assert!(!sup.is_current_session(epoch));
    }
}
