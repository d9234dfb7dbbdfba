//! Connection reconciler
//!
//! Maps agent-side connection lifecycle onto [`Connection::status`]:
//!
//! | Agent event | Local status | Result |
//! |---|---|---|
//! | `completed` | `pending` | `unverified`, agent connection id stored |
//! | `abandoned` | anything but `disconnected` | `disconnected` |
//! | DID rotated with their DID cleared | any | `disconnected` |
//! | anything else | any | no-op |
//!
//! Status changes only go through [`Connection::transition`], so replaying
//! events in any order can never move a connection backwards.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ReconcileError, ReconcileResult};
use crate::agent::AgentApi;
use crate::events::{AgentConnectionState, AgentEvent, ConnectionRecord, DidRotated, EventHandler};
use crate::state::{Connection, ConnectionStatus, SharedStore, Transaction};

/// What a connection event did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// No invite matches the agent connection.
    Orphaned,
    Unchanged,
    Transitioned {
        connection_id: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
}

pub struct ConnectionReconciler {
    store: SharedStore,
    agent: Arc<dyn AgentApi>,
    close_orphaned: bool,
}

impl ConnectionReconciler {
    pub fn new(store: SharedStore, agent: Arc<dyn AgentApi>) -> Self {
        Self {
            store,
            agent,
            close_orphaned: false,
        }
    }

    /// Ask the agent to close connections that match no local invite.
    pub fn with_close_orphaned(mut self, close: bool) -> Self {
        self.close_orphaned = close;
        self
    }

    pub async fn on_state_changed(
        &self,
        record: &ConnectionRecord,
    ) -> ReconcileResult<ConnectionOutcome> {
        let mut tx = self.store.begin().await;

        let invite = match record.out_of_band_id.as_deref() {
            Some(oob_id) => tx.invite_by_oob_id(oob_id)?,
            None => None,
        };
        let Some(invite) = invite else {
            drop(tx);
            self.handle_orphan(record).await;
            return Ok(ConnectionOutcome::Orphaned);
        };

        let conn: Connection = tx
            .get(&invite.connection_id)?
            .ok_or_else(|| ReconcileError::ConnectionNotFound(invite.connection_id.clone()))?;

        let next = match (record.state, conn.status) {
            (AgentConnectionState::Completed, ConnectionStatus::Pending) => {
                Some(ConnectionStatus::Unverified)
            }
            (AgentConnectionState::Abandoned, status) if status != ConnectionStatus::Disconnected => {
                Some(ConnectionStatus::Disconnected)
            }
            _ => None,
        };

        let Some(next) = next else {
            debug!(
                connection_id = %conn.id,
                agent_state = ?record.state,
                status = %conn.status,
                "Connection already reconciled"
            );
            return Ok(ConnectionOutcome::Unchanged);
        };

        let agent_connection_id = record.id.clone();
        let outcome = apply_transition(&mut tx, &conn, next, move |c| {
            if next == ConnectionStatus::Unverified {
                c.agent_connection_id = Some(agent_connection_id);
            }
        })?;
        tx.commit()?;
        Ok(outcome)
    }

    pub async fn on_did_rotated(&self, rotated: &DidRotated) -> ReconcileResult<ConnectionOutcome> {
        if !rotated.counterparty_hung_up() {
            debug!(agent_connection_id = %rotated.connection_record.id, "DID rotated, connection kept");
            return Ok(ConnectionOutcome::Unchanged);
        }

        let mut tx = self.store.begin().await;
        let record = &rotated.connection_record;

        let mut conn = tx.connection_by_agent_id(&record.id)?;
        if conn.is_none() {
            if let Some(oob_id) = record.out_of_band_id.as_deref() {
                if let Some(invite) = tx.invite_by_oob_id(oob_id)? {
                    conn = tx.get(&invite.connection_id)?;
                }
            }
        }
        let Some(conn) = conn else {
            warn!(agent_connection_id = %record.id, "Counterparty hung up on unknown connection");
            return Ok(ConnectionOutcome::Orphaned);
        };

        if conn.status == ConnectionStatus::Disconnected {
            return Ok(ConnectionOutcome::Unchanged);
        }

        let outcome = apply_transition(&mut tx, &conn, ConnectionStatus::Disconnected, |_| {})?;
        tx.commit()?;
        Ok(outcome)
    }

    async fn handle_orphan(&self, record: &ConnectionRecord) {
        warn!(
            agent_connection_id = %record.id,
            out_of_band_id = ?record.out_of_band_id,
            agent_state = ?record.state,
            "No invite for agent connection"
        );
        if !self.close_orphaned {
            return;
        }
        if let Err(e) = self.agent.close_connection(&record.id).await {
            warn!(agent_connection_id = %record.id, error = %e, "Failed to close orphaned connection");
        }
    }
}

fn apply_transition(
    tx: &mut Transaction,
    conn: &Connection,
    next: ConnectionStatus,
    extra: impl FnOnce(&mut Connection),
) -> ReconcileResult<ConnectionOutcome> {
    let from = conn.status;
    let updated = tx.update::<Connection>(&conn.id, |c| {
        if c.transition(next) {
            extra(c);
        }
    })?;
    if updated.status == from {
        return Ok(ConnectionOutcome::Unchanged);
    }
    info!(connection_id = %conn.id, from = %from, to = %updated.status, "Connection status changed");
    Ok(ConnectionOutcome::Transitioned {
        connection_id: conn.id.clone(),
        from,
        to: updated.status,
    })
}

#[async_trait]
impl EventHandler<AgentEvent> for ConnectionReconciler {
    fn name(&self) -> &str {
        "connection-reconciler"
    }

    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        match event {
            AgentEvent::ConnectionStateChanged(record) => {
                self.on_state_changed(record).await?;
            }
            AgentEvent::ConnectionDidRotated(rotated) => {
                self.on_did_rotated(rotated).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DidChange;
    use crate::reconcilers::testing::RecordingAgent;
    use crate::state::{ConnectionInvite, Store};

    struct Fixture {
        store: SharedStore,
        agent: Arc<RecordingAgent>,
        reconciler: ConnectionReconciler,
        connection_id: String,
    }

    async fn fixture(close_orphaned: bool) -> Fixture {
        let store = Store::in_memory().shared();
        let agent = Arc::new(RecordingAgent::default());
        let conn = store.insert(Connection::new("Acme Ltd", "07964699")).await.unwrap();
        store
            .insert(ConnectionInvite::new(&conn.id, "oob-1", true))
            .await
            .unwrap();
        let reconciler = ConnectionReconciler::new(store.clone(), agent.clone())
            .with_close_orphaned(close_orphaned);
        Fixture {
            store,
            agent,
            reconciler,
            connection_id: conn.id,
        }
    }

    fn record(state: AgentConnectionState, oob: Option<&str>) -> ConnectionRecord {
        ConnectionRecord {
            id: "agent-conn-1".into(),
            state,
            out_of_band_id: oob.map(String::from),
            their_label: None,
        }
    }

    fn hung_up() -> DidRotated {
        DidRotated {
            connection_record: record(AgentConnectionState::Completed, Some("oob-1")),
            their_did: Some(DidChange {
                from: Some("did:peer:1".into()),
                to: None,
            }),
            our_did: None,
        }
    }

    async fn status(f: &Fixture) -> ConnectionStatus {
        let conn: Connection = f.store.get(&f.connection_id).await.unwrap().unwrap();
        conn.status
    }

    #[tokio::test]
    async fn test_completed_moves_pending_to_unverified() {
        let f = fixture(false).await;
        let outcome = f
            .reconciler
            .on_state_changed(&record(AgentConnectionState::Completed, Some("oob-1")))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ConnectionOutcome::Transitioned {
                connection_id: f.connection_id.clone(),
                from: ConnectionStatus::Pending,
                to: ConnectionStatus::Unverified,
            }
        );
        let conn: Connection = f.store.get(&f.connection_id).await.unwrap().unwrap();
        assert_eq!(conn.agent_connection_id.as_deref(), Some("agent-conn-1"));
    }

    #[tokio::test]
    async fn test_transient_states_are_ignored() {
        let f = fixture(false).await;
        for state in [
            AgentConnectionState::RequestReceived,
            AgentConnectionState::ResponseSent,
            AgentConnectionState::Unknown,
        ] {
            let outcome = f
                .reconciler
                .on_state_changed(&record(state, Some("oob-1")))
                .await
                .unwrap();
            assert_eq!(outcome, ConnectionOutcome::Unchanged);
        }
        assert_eq!(status(&f).await, ConnectionStatus::Pending);
    }

    #[tokio::test]
    async fn test_completed_does_not_regress_verified_connection() {
        let f = fixture(false).await;
        let mut tx = f.store.begin().await;
        tx.update::<Connection>(&f.connection_id, |c| c.status = ConnectionStatus::VerifiedBoth)
            .unwrap();
        tx.commit().unwrap();

        f.reconciler
            .on_state_changed(&record(AgentConnectionState::Completed, Some("oob-1")))
            .await
            .unwrap();
        assert_eq!(status(&f).await, ConnectionStatus::VerifiedBoth);
    }

    #[tokio::test]
    async fn test_abandoned_disconnects_once() {
        let f = fixture(false).await;
        let abandoned = record(AgentConnectionState::Abandoned, Some("oob-1"));

        let first = f.reconciler.on_state_changed(&abandoned).await.unwrap();
        assert!(matches!(first, ConnectionOutcome::Transitioned { to: ConnectionStatus::Disconnected, .. }));
        let second = f.reconciler.on_state_changed(&abandoned).await.unwrap();
        assert_eq!(second, ConnectionOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_orphan_without_policy_is_left_alone() {
        let f = fixture(false).await;
        let outcome = f
            .reconciler
            .on_state_changed(&record(AgentConnectionState::Completed, Some("oob-unknown")))
            .await
            .unwrap();

        assert_eq!(outcome, ConnectionOutcome::Orphaned);
        assert!(f.agent.closed.lock().unwrap().is_empty());
        assert_eq!(status(&f).await, ConnectionStatus::Pending);
    }

    #[tokio::test]
    async fn test_orphan_is_closed_when_configured() {
        let f = fixture(true).await;
        let outcome = f
            .reconciler
            .on_state_changed(&record(AgentConnectionState::Completed, None))
            .await
            .unwrap();

        assert_eq!(outcome, ConnectionOutcome::Orphaned);
        assert_eq!(*f.agent.closed.lock().unwrap(), vec!["agent-conn-1".to_string()]);
        assert_eq!(status(&f).await, ConnectionStatus::Pending);
    }

    #[tokio::test]
    async fn test_hang_up_disconnects_from_any_status() {
        let f = fixture(false).await;
        f.reconciler
            .on_state_changed(&record(AgentConnectionState::Completed, Some("oob-1")))
            .await
            .unwrap();

        let outcome = f.reconciler.on_did_rotated(&hung_up()).await.unwrap();
        assert!(matches!(
            outcome,
            ConnectionOutcome::Transitioned {
                from: ConnectionStatus::Unverified,
                to: ConnectionStatus::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rotation_to_new_did_is_ignored() {
        let f = fixture(false).await;
        let mut rotated = hung_up();
        rotated.their_did = Some(DidChange {
            from: Some("did:peer:1".into()),
            to: Some("did:peer:2".into()),
        });
        assert_eq!(
            f.reconciler.on_did_rotated(&rotated).await.unwrap(),
            ConnectionOutcome::Unchanged
        );
        assert_eq!(status(&f).await, ConnectionStatus::Pending);
    }

    #[tokio::test]
    async fn test_any_delivery_order_ends_disconnected_and_sticky() {
        let events = [
            AgentEvent::ConnectionStateChanged(record(AgentConnectionState::Completed, Some("oob-1"))),
            AgentEvent::ConnectionDidRotated(hung_up()),
            AgentEvent::ConnectionStateChanged(record(AgentConnectionState::Abandoned, Some("oob-1"))),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let f = fixture(false).await;
            let mut seen = vec![ConnectionStatus::Pending];
            for i in order {
                f.reconciler.handle(&events[i]).await.unwrap();
                seen.push(status(&f).await);
            }
            for pair in seen.windows(2) {
                assert!(
                    pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
                    "order {:?} regressed {} -> {}",
                    order,
                    pair[0],
                    pair[1]
                );
            }
            assert_eq!(status(&f).await, ConnectionStatus::Disconnected, "order {:?}", order);
        }
    }
}
