#[cfg(test)]
mod tests {
    use crate::messaging::broker::create_message_broker;
    use crate::messaging::consumer::{MessageHandler, ProcessingError, QueueConsumer};
    use crate::messaging::event::{EventEnvelope, EventType, RoutingAttributes};
    use crate::config::MessageBrokerConfig;
    use crate::testing::envelope;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    /// Records what it receives; fails the first delivery of each event
    /// when `fail_first` is set
    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<(EventEnvelope, RoutingAttributes)>>,
        fail_first: bool,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(
            &self,
            body: &[u8],
            attributes: &RoutingAttributes,
            arrived_at: DateTime<Utc>,
        ) -> Result<(), ProcessingError> {
            let envelope = EventEnvelope::decode(body, arrived_at)?;
            let mut received = self.received.lock().unwrap();
            let seen_before = received.iter().any(|(e, _)| e.event_id == envelope.event_id);
            received.push((envelope, attributes.clone()));

            if self.fail_first && !seen_before {
                return Err(ProcessingError::Reconcile(anyhow::anyhow!("registry unreachable")));
            }
            Ok(())
        }
    }

    fn isolated_config() -> MessageBrokerConfig {
        let suffix = uuid::Uuid::new_v4();
        MessageBrokerConfig {
            exchange: format!("test.trap.events.{}", suffix),
            queue: format!("test-trap-events-{}", suffix),
            dead_letter_exchange: format!("test.trap.events.dlx.{}", suffix),
            dead_letter_queue: format!("test-trap-events-dead-letter-{}", suffix),
            requeue_delay_ms: 10,
            ..MessageBrokerConfig::default()
        }
    }

    // Test that we can create a message broker and declare the topology
    #[tokio::test]
    async fn test_create_message_broker() -> Result<()> {
        // Skip test if no RabbitMQ is available
        if std::env::var("TEST_RABBITMQ").is_err() {
            println!("Skipping RabbitMQ test. Set TEST_RABBITMQ=1 to run.");
            return Ok(());
        }

        let broker = create_message_broker(isolated_config()).await?;
        broker.close().await;
        Ok(())
    }

    // Test that a published envelope reaches the handler with its headers
    #[tokio::test]
    async fn test_publish_consume() -> Result<()> {
        if std::env::var("TEST_RABBITMQ").is_err() {
            println!("Skipping RabbitMQ test. Set TEST_RABBITMQ=1 to run.");
            return Ok(());
        }

        let broker = create_message_broker(isolated_config()).await?;
        let handler = Arc::new(RecordingHandler::default());
        let consumer = QueueConsumer::new(broker.clone(), handler.clone());
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let token = token.clone();
            async move { consumer.run(token).await }
        });

        sleep(Duration::from_millis(500)).await;

        let sent = envelope("TRAP-SB-001-01", EventType::Capture);
        broker.publish_envelope(&sent).await?;

        sleep(Duration::from_millis(1000)).await;
        token.cancel();
        run.await?;

        let received = handler.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.event_id, sent.event_id);
        assert_eq!(received[0].1.device_id.as_deref(), Some("TRAP-SB-001-01"));
        assert_eq!(received[0].1.event_type.as_deref(), Some("Capture"));

        broker.close().await;
        Ok(())
    }

    // Test that a failed message is redelivered instead of acknowledged
    #[tokio::test]
    async fn test_failed_message_is_redelivered() -> Result<()> {
        if std::env::var("TEST_RABBITMQ").is_err() {
            println!("Skipping RabbitMQ test. Set TEST_RABBITMQ=1 to run.");
            return Ok(());
        }

        let broker = create_message_broker(isolated_config()).await?;
        let handler = Arc::new(RecordingHandler {
            fail_first: true,
            ..RecordingHandler::default()
        });
        let consumer = QueueConsumer::new(broker.clone(), handler.clone());
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let token = token.clone();
            async move { consumer.run(token).await }
        });

        sleep(Duration::from_millis(500)).await;
        broker
            .publish_envelope(&envelope("TRAP-SB-001-02", EventType::Malfunction))
            .await?;

        sleep(Duration::from_millis(1500)).await;
        token.cancel();
        run.await?;

        let received = handler.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.event_id, received[1].0.event_id);

        broker.close().await;
        Ok(())
    }
}
