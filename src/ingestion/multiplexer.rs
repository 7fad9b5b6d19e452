// DANS : src/ingestion/multiplexer.rs
//
// Le fan-in : K sources redondantes entrent, un seul flux dédupliqué sort.
// `select_all` garantit qu'une source muette ou en pleine reconnexion ne
// retient jamais les autres.

use crate::ingestion::RawEvent;
use crate::ingestion::dedup::SignatureCache;
use crate::monitoring::metrics;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

pub struct EventMultiplexer {
    inputs: Vec<mpsc::Receiver<RawEvent>>,
    output: mpsc::UnboundedSender<RawEvent>,
    dedup: SignatureCache,
}

impl EventMultiplexer {
    pub fn new(
        inputs: Vec<mpsc::Receiver<RawEvent>>,
        dedup_window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RawEvent>) {
        let (output, receiver) = mpsc::unbounded_channel();
        let multiplexer = Self {
            inputs,
            output,
            dedup: SignatureCache::new(dedup_window),
        };
        (multiplexer, receiver)
    }

    pub fn start(self) -> JoinHandle<()> {
        info!(
            sources = self.inputs.len(),
            "[Multiplexeur] Démarrage du fan-in."
        );
        tokio::spawn(async move {
            self.run().await;
            info!("[Multiplexeur] Toutes les sources sont fermées, arrêt.");
        })
    }

    async fn run(mut self) {
        let streams: Vec<_> = self
            .inputs
            .drain(..)
            .map(ReceiverStream::new)
            .collect();
        let mut merged = futures_util::stream::select_all(streams);

        while let Some(event) = merged.next().await {
            if !self.dedup.insert(event.signature) {
                metrics::DUPLICATES_DROPPED
                    .with_label_values(&[&event.source.to_string()])
                    .inc();
                continue;
            }
            metrics::EVENTS_FORWARDED.inc();
            metrics::LAST_EVENT_UNIX_SECONDS.set(chrono::Utc::now().timestamp());
            if self.output.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::SourceId;
    use solana_sdk::hash::Hash;
    use solana_sdk::signature::Signature;

    fn event(n: u8, source: SourceId) -> RawEvent {
        RawEvent {
            source,
            signature: Signature::from([n; 64]),
            slot: 1,
            recent_blockhash: Hash::default(),
            account_keys: vec![],
            instructions: vec![],
            inner_instructions: vec![],
            balance_deltas: vec![],
            failed: false,
            error_code: None,
            loaded_writable: vec![],
            loaded_readonly: vec![],
            table_lookups: vec![],
        }
    }

    async fn drain(mut receiver: mpsc::UnboundedReceiver<RawEvent>) -> Vec<RawEvent> {
        let mut all = Vec::new();
        while let Some(event) = receiver.recv().await {
            all.push(event);
        }
        all
    }

    #[tokio::test]
    async fn duplicates_across_sources_are_dropped() {
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (multiplexer, output) =
            EventMultiplexer::new(vec![rx_a, rx_b], Duration::from_secs(3000));
        let handle = multiplexer.start();

        tx_a.send(event(1, SourceId(0))).await.unwrap();
        tx_b.send(event(1, SourceId(1))).await.unwrap();
        tx_b.send(event(2, SourceId(1))).await.unwrap();
        drop(tx_a);
        drop(tx_b);

        let forwarded = drain(output).await;
        handle.await.unwrap();

        assert_eq!(forwarded.len(), 2);
        let ones = forwarded
            .iter()
            .filter(|e| e.signature == Signature::from([1; 64]))
            .count();
        assert_eq!(ones, 1);
        assert!(
            forwarded
                .iter()
                .any(|e| e.signature == Signature::from([2; 64]))
        );
    }

    #[tokio::test]
    async fn replays_from_the_same_source_are_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let (multiplexer, output) = EventMultiplexer::new(vec![rx], Duration::from_secs(3000));
        let handle = multiplexer.start();

        // Une reconnexion Geyser peut rejouer les dernières transactions.
        tx.send(event(3, SourceId(0))).await.unwrap();
        tx.send(event(3, SourceId(0))).await.unwrap();
        drop(tx);

        let forwarded = drain(output).await;
        handle.await.unwrap();
        assert_eq!(forwarded.len(), 1);
    }

    #[tokio::test]
    async fn a_silent_source_does_not_block_the_others() {
        let (tx_a, rx_a) = mpsc::channel(8);
        let (_tx_b, rx_b) = mpsc::channel::<RawEvent>(8);
        let (multiplexer, mut output) =
            EventMultiplexer::new(vec![rx_a, rx_b], Duration::from_secs(3000));
        let _handle = multiplexer.start();

        tx_a.send(event(9, SourceId(0))).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), output.recv())
            .await
            .expect("le fan-in ne doit pas attendre la source muette")
            .expect("un événement doit sortir");
        assert_eq!(received.signature, Signature::from([9; 64]));
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_order_wins_across_sources() {
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (multiplexer, output) =
            EventMultiplexer::new(vec![rx_a, rx_b], Duration::from_secs(3000));
        let handle = multiplexer.start();

        // A émet à 0/10/20 ms, B à 5 ms : l'événement de B doit sortir
        // entre le premier et le deuxième de A.
        let start = tokio::time::Instant::now();
        let sender_a = tokio::spawn(async move {
            for (n, at_ms) in [(10u8, 0u64), (11, 10), (12, 20)] {
                tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
                tx_a.send(event(n, SourceId(0))).await.unwrap();
            }
        });
        let sender_b = tokio::spawn(async move {
            tokio::time::sleep_until(start + Duration::from_millis(5)).await;
            tx_b.send(event(20, SourceId(1))).await.unwrap();
        });
        sender_a.await.unwrap();
        sender_b.await.unwrap();

        let forwarded = drain(output).await;
        handle.await.unwrap();

        let order: Vec<Signature> = forwarded.iter().map(|e| e.signature).collect();
        let expected: Vec<Signature> = [10u8, 20, 11, 12]
            .iter()
            .map(|n| Signature::from([*n; 64]))
            .collect();
        assert_eq!(order, expected);
    }
}
