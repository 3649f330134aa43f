use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

/// Coalesces concurrent work per key: the first caller starts the
/// computation, later callers for the same key await the same shared future
/// and observe the same result. The work is detached from its callers: a
/// caller that gives up does not cancel or wedge the flight, which runs to
/// completion on its own task and removes its map entry when it resolves,
/// so a later call starts fresh (a failed build can be retried by the next
/// request).
pub struct Group<T: Clone> {
    flights: Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>>,
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Group {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run<F>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let flight = {
            let mut flights = self.flights.lock().await;
            match flights.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let flights_ref = Arc::clone(&self.flights);
                    let owned_key = key.to_string();
                    let work = make();
                    let flight: Shared<BoxFuture<'static, T>> = async move {
                        let out = work.await;
                        flights_ref.lock().await.remove(&owned_key);
                        out
                    }
                    .boxed()
                    .shared();
                    // The driver holds its own clone, so the flight finishes
                    // even when every caller has been dropped.
                    tokio::spawn(flight.clone().map(|_| ()));
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };
        flight.await
    }
}
