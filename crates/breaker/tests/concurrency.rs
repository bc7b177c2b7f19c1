use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breaker::{CallError, CircuitBreaker, CircuitBreakerConfig};
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn in_flight_calls_never_exceed_cap() {
    let breaker = Arc::new(
        CircuitBreaker::new(
            "cap",
            CircuitBreakerConfig {
                max_concurrent: 2,
                call_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let breaker = breaker.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(breaker.stats().total_calls, 8);
}

#[test(tokio::test)]
async fn waiting_for_a_permit_counts_against_the_deadline() {
    let breaker = Arc::new(
        CircuitBreaker::new(
            "deadline",
            CircuitBreakerConfig {
                max_concurrent: 1,
                call_timeout: Duration::from_millis(100),
                failure_threshold: 10,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let holder = {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok::<_, String>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let waiter = breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok::<_, String>(())
        })
        .await;

    assert!(holder.await.unwrap().is_ok());
    assert!(matches!(waiter, Err(CallError::Timeout(_))));
}
