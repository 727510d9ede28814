//! A two-participant transaction driven over the TCP transport, with the
//! second participant's confirm failing and being finished by recovery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_core::{Attachments, ManualClock, Value};
use meridian_server::service::{
    handler_fn, CallError, DispatchPipeline, HttpMethod, Invocation, ParameterFrom, ParameterType, RpcParameter,
    ServerConfig, ServiceEntry, ServiceEntryRegistry, ServiceHandler,
};
use meridian_server::tcc::{
    IdempotentPhase, InMemoryTransRepository, ParticipantStatus, TccCoordinator, TccLeg, TransLogStore,
    TransactionConfig, TransactionStatus,
};
use meridian_server::transport::{RemoteInvoker, TcpMessageSender, TcpRpcServer, TcpTransportConfig};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// One resource-holding service with try/confirm/cancel entries.
#[derive(Default)]
struct Ledger {
    tried: AtomicUsize,
    confirmed: AtomicUsize,
    cancelled: AtomicUsize,
    fail_confirm: AtomicBool,
    slow_confirm: AtomicBool,
}

impl Ledger {
    fn entries(self: &Arc<Self>, name: &str) -> Vec<ServiceEntry> {
        let on_try = {
            let ledger = self.clone();
            handler_fn(move |inv: Invocation| {
                let ledger = ledger.clone();
                async move {
                    ledger.tried.fetch_add(1, Ordering::SeqCst);
                    match inv.args[0].as_i64() {
                        Some(amount) if amount > 100 => Err(CallError::business("limit exceeded")),
                        _ => Ok(Value::Bool(true)),
                    }
                }
            })
        };
        let on_confirm = {
            let ledger = self.clone();
            handler_fn(move |_inv: Invocation| {
                let ledger = ledger.clone();
                async move {
                    if ledger.slow_confirm.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    if ledger.fail_confirm.load(Ordering::SeqCst) {
                        return Err(CallError::internal("ledger unavailable"));
                    }
                    ledger.confirmed.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };
        let on_cancel = {
            let ledger = self.clone();
            handler_fn(move |_inv: Invocation| {
                let ledger = ledger.clone();
                async move {
                    ledger.cancelled.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };

        let entry = |phase: &str, handler: Arc<dyn ServiceHandler>| {
            ServiceEntry::builder(format!("{name}.{phase}"), HttpMethod::Post, format!("/{name}/{phase}"))
                .param(RpcParameter::builder("amount", ParameterFrom::Body, ParameterType::Int))
                .handler(handler)
                .build()
                .unwrap()
        };
        vec![
            entry("try", on_try),
            entry("confirm", IdempotentPhase::wrap(on_confirm)),
            entry("cancel", IdempotentPhase::wrap(on_cancel)),
        ]
    }
}

struct Cluster {
    inventory: Arc<Ledger>,
    payment: Arc<Ledger>,
    clock: Arc<ManualClock>,
    store: Arc<TransLogStore>,
    coordinator: TccCoordinator,
    _stop: watch::Sender<bool>,
}

/// Serves both ledgers from a participant node over TCP and points a
/// coordinator at it.
async fn cluster() -> Cluster {
    let inventory = Arc::new(Ledger::default());
    let payment = Arc::new(Ledger::default());
    let registry = Arc::new(ServiceEntryRegistry::new());
    let mut entries = inventory.entries("inventory");
    entries.extend(payment.entries("payment"));
    registry.replace_all(entries).unwrap();
    let pipeline = Arc::new(DispatchPipeline::new(registry, Arc::new(ServerConfig::default())));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = watch::channel(false);
    tokio::spawn(TcpRpcServer::new(pipeline, TcpTransportConfig::default()).serve(listener, stopped));

    let client = TcpMessageSender::client(addr, &TcpTransportConfig::default()).await.unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = Arc::new(TransLogStore::new(Arc::new(InMemoryTransRepository::new()), true));
    let config = TransactionConfig {
        recover_delay_ms: 1_000,
        phase_timeout_ms: 100,
        cleanup_immediately: false,
        ..TransactionConfig::default()
    };
    let coordinator = TccCoordinator::new(
        store.clone(),
        RemoteInvoker::new(Arc::new(client)),
        clock.clone(),
        config,
        "coordinator-1",
    );

    Cluster {
        inventory,
        payment,
        clock,
        store,
        coordinator,
        _stop: stop,
    }
}

fn leg(service: &str, amount: i64) -> TccLeg {
    TccLeg::new(
        format!("{service}.try"),
        format!("{service}.confirm"),
        format!("{service}.cancel"),
        vec![Value::Int(amount)],
    )
}

async fn place_order(c: &Cluster, amount: i64) -> (String, Result<(), CallError>) {
    let trans_id = Arc::new(Mutex::new(String::new()));
    let result = c
        .coordinator
        .execute(Attachments::new(), |scope| {
            let trans_id = trans_id.clone();
            async move {
                *trans_id.lock() = scope.trans_id().to_string();
                scope.try_leg(leg("inventory", 1)).await?;
                scope.try_leg(leg("payment", amount)).await?;
                Ok(())
            }
        })
        .await;
    let id = trans_id.lock().clone();
    (id, result)
}

async fn status_of(c: &Cluster, trans_id: &str) -> Option<TransactionStatus> {
    c.store.load_transaction(trans_id).await.unwrap().map(|t| t.status)
}

#[tokio::test]
async fn recovery_confirms_the_leg_whose_confirm_failed() {
    let c = cluster().await;
    c.payment.fail_confirm.store(true, Ordering::SeqCst);

    let (trans_id, result) = place_order(&c, 40).await;
    assert!(result.is_ok(), "confirm failures are not surfaced to the caller");
    assert_eq!(c.inventory.confirmed.load(Ordering::SeqCst), 1);
    assert_eq!(c.payment.confirmed.load(Ordering::SeqCst), 0);
    assert_eq!(status_of(&c, &trans_id).await, Some(TransactionStatus::Confirming));

    // Too early: the participant is younger than the recovery delay.
    let report = c.coordinator.recover(c.coordinator.now()).await.unwrap();
    assert_eq!(report.scanned, 0);

    c.payment.fail_confirm.store(false, Ordering::SeqCst);
    c.clock.advance(2_000);
    let report = c.coordinator.recover(c.coordinator.now()).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.finalized, 1);

    assert_eq!(c.payment.confirmed.load(Ordering::SeqCst), 1);
    assert_eq!(c.inventory.confirmed.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&c, &trans_id).await, Some(TransactionStatus::Committed));
    let participants = c.store.participants_of(&trans_id).await.unwrap();
    assert_eq!(participants.len(), 2);
    assert!(participants.iter().all(|p| p.status == ParticipantStatus::Confirmed));

    // Nothing left to do.
    let report = c.coordinator.recover(c.coordinator.now()).await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn rejected_try_cancels_both_legs() {
    let c = cluster().await;
    let (trans_id, result) = place_order(&c, 500).await;

    assert!(matches!(result, Err(CallError::Business { .. })));
    assert_eq!(c.inventory.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(c.payment.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(c.inventory.confirmed.load(Ordering::SeqCst), 0);
    assert_eq!(status_of(&c, &trans_id).await, Some(TransactionStatus::Rollbacked));
}

#[tokio::test]
async fn late_confirm_is_not_applied_twice() {
    let c = cluster().await;
    c.payment.slow_confirm.store(true, Ordering::SeqCst);

    let (trans_id, result) = place_order(&c, 40).await;
    assert!(result.is_ok());
    // The coordinator gave up after its phase timeout; the remote confirm
    // is still running.
    assert_eq!(status_of(&c, &trans_id).await, Some(TransactionStatus::Confirming));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(c.payment.confirmed.load(Ordering::SeqCst), 1);

    c.clock.advance(2_000);
    let report = c.coordinator.recover(c.coordinator.now()).await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(c.payment.confirmed.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&c, &trans_id).await, Some(TransactionStatus::Committed));
}
