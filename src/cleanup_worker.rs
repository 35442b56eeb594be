//! Order cleanup worker (spec §4.F). Subscribes to `CLOSED`/`REDUCED`
//! position events and cancels (or modifies) orphaned protective
//! orders under a distributed lock, via the broker adapter's circuit
//! breaker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::broker::BrokerAdapter;
use crate::circuit_breaker::CircuitBreaker;
use crate::hub::Hub;
use crate::lock::DistributedLock;
use crate::model::{
    CleanupAction, CleanupLogRow, CleanupOutcome, OrderPurpose, OrderReference, PositionEvent, PositionEventKind,
    WsEvent,
};
use crate::persistence::OrderRepository;

/// spec §4.F step 1: 30s lease, 100ms acquire budget before the work
/// item is dropped (another node will handle it; events are idempotent).
const LOCK_LEASE: Duration = Duration::from_secs(30);
const LOCK_ACQUIRE_BUDGET: Duration = Duration::from_millis(100);
const BROKER_CALL_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnReducePolicy {
    CancelAll,
    ModifyToNewQuantity,
}

pub struct CleanupWorker {
    lock: Arc<dyn DistributedLock>,
    orders: Arc<dyn OrderRepository>,
    broker: Arc<dyn BrokerAdapter>,
    breaker: Arc<CircuitBreaker>,
    event_hub: Arc<Hub<WsEvent>>,
    on_reduce_policy: OnReducePolicy,
}

impl CleanupWorker {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        orders: Arc<dyn OrderRepository>,
        broker: Arc<dyn BrokerAdapter>,
        breaker: Arc<CircuitBreaker>,
        event_hub: Arc<Hub<WsEvent>>,
        on_reduce_policy: OnReducePolicy,
    ) -> Arc<Self> {
        Arc::new(Self { lock, orders, broker, breaker, event_hub, on_reduce_policy })
    }

    /// Runs until `shutdown` cancels. Drives the position-event
    /// subscription directly; intended to be wrapped in a
    /// [`crate::supervisor::TaskSpec`] runner closure.
    pub async fn run(self: Arc<Self>, position_events: Arc<Hub<PositionEvent>>, shutdown: tokio_util::sync::CancellationToken) {
        let predicate = Arc::new(|e: &PositionEvent| matches!(e.kind, PositionEventKind::Closed | PositionEventKind::Reduced));
        let mut sub = position_events.subscribe(predicate);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = sub.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: PositionEvent) {
        let lock_key = format!("cleanup:{}", event.account_id);
        let token = match tokio::time::timeout(LOCK_ACQUIRE_BUDGET, self.lock.acquire(&lock_key, LOCK_LEASE)).await {
            Ok(Ok(Some(token))) => token,
            Ok(Ok(None)) | Err(_) => {
                info!(account = %event.account_id, "cleanup lock unavailable, another node will handle it");
                return;
            }
            Ok(Err(e)) => {
                warn!(account = %event.account_id, error = %e, "cleanup lock acquisition failed");
                return;
            }
        };

        let orders = match self.orders.find_protective_orders(&event.account_id, &event.instrument_key).await {
            Ok(orders) => orders,
            Err(e) => {
                error!(account = %event.account_id, error = %e, "failed to look up protective orders");
                let _ = self.lock.release(&lock_key, &token).await;
                return;
            }
        };

        for order in orders {
            self.cleanup_one(&event, &order).await;
        }

        let _ = self.lock.release(&lock_key, &token).await;
    }

    async fn cleanup_one(&self, event: &PositionEvent, order: &OrderReference) {
        let action = match (event.kind, self.on_reduce_policy) {
            (PositionEventKind::Closed, _) => CleanupAction::Cancel,
            (PositionEventKind::Reduced, OnReducePolicy::CancelAll) => CleanupAction::Cancel,
            (PositionEventKind::Reduced, OnReducePolicy::ModifyToNewQuantity) => CleanupAction::Modify,
            _ => return,
        };

        let outcome = self.call_broker_with_retry(order, action, event.new_quantity).await;

        self.event_hub.broadcast(WsEvent::OrderEvent {
            payload: crate::model::OrderEventPayload {
                account_id: order.account_id.clone(),
                broker_order_id: order.broker_order_id.clone(),
                instrument_key: order.instrument_key.clone(),
                action,
                outcome,
            },
        });

        let detail = if outcome == CleanupOutcome::Failed {
            Some(format!("broker call exhausted {BROKER_CALL_RETRIES} attempts"))
        } else {
            None
        };
        let row = CleanupLogRow {
            account_id: order.account_id.clone(),
            broker_order_id: order.broker_order_id.clone(),
            instrument_key: order.instrument_key.clone(),
            action,
            outcome,
            detail,
            created_at: now_ms(),
        };
        if let Err(e) = self.orders.record_cleanup(row).await {
            error!(order = %order.broker_order_id, error = %e, "failed to record cleanup log row");
        }

        if outcome == CleanupOutcome::Failed {
            error!(
                account = %order.account_id,
                order = %order.broker_order_id,
                purpose = ?order.purpose,
                "protective order cleanup failed after retries; audited, worker continues"
            );
        }
    }

    /// Routes each attempt through the circuit breaker (spec §4.F step
    /// 4). Retries with backoff up to [`BROKER_CALL_RETRIES`]; final
    /// failure is logged and returned as [`CleanupOutcome::Failed`]
    /// rather than propagated — the worker never crashes on a broker
    /// failure.
    async fn call_broker_with_retry(&self, order: &OrderReference, action: CleanupAction, new_quantity: i64) -> CleanupOutcome {
        let mut backoff = Duration::from_millis(200);
        for attempt in 1..=BROKER_CALL_RETRIES {
            if !self.breaker.allow() {
                warn!(order = %order.broker_order_id, "broker circuit breaker open, skipping attempt");
                return CleanupOutcome::Failed;
            }

            let result = match action {
                CleanupAction::Cancel => self.broker.cancel_order(order).await,
                CleanupAction::Modify => self.broker.modify_order(order, new_quantity).await,
            };

            match result {
                Ok(()) => {
                    self.breaker.record_success();
                    return CleanupOutcome::Succeeded;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(order = %order.broker_order_id, attempt, error = %e, "broker cleanup call failed");
                    if attempt < BROKER_CALL_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        CleanupOutcome::Failed
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
