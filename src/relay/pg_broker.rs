use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use super::broker::{Broker, BrokerError, PayloadStream};

/// Postgres `LISTEN/NOTIFY` broker.
///
/// Notifications are fire-and-forget: a node that is not listening when a
/// payload is published never sees it. Payloads are capped by Postgres at
/// 8000 bytes, which is why the relay chunks large operations.
pub struct PgBroker {
    pool: PgPool,
    channel: String,
}

impl PgBroker {
    /// Connect to the broker database
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    /// * `channel` - Notification channel shared by all nodes of a cluster
    pub async fn connect(database_url: &str, channel: &str) -> Result<Self, BrokerError> {
        info!("Connecting to broker on channel '{}'...", channel);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!("Broker connection pool created successfully");

        Ok(Self {
            pool,
            channel: channel.to_string(),
        })
    }
}

impl Broker for PgBroker {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn publish(&self, payload: String) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&self.channel)
                .bind(payload)
                .execute(&self.pool)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, BrokerError>> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool)
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            listener
                .listen(&self.channel)
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            info!("Listening on broker channel '{}'", self.channel);

            let stream = listener
                .into_stream()
                .map(|notification| {
                    notification
                        .map(|n| n.payload().to_string())
                        .map_err(BrokerError::from)
                })
                .boxed();
            Ok(stream)
        })
    }
}
