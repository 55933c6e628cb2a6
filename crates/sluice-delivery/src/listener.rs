//! Change notifications that wake the delivery engine.
//!
//! The outbox trigger issues `NOTIFY` on a channel after each insert. The
//! payload is advisory: the engine only uses a notification as a cue to drain
//! a burst, and the poll loop covers any notification that gets lost.

use std::{future::Future, pin::Pin};

use sluice_core::CoreError;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Source of wake-up signals for the notification-driven path.
pub trait ChangeNotifications: Send + 'static {
    /// Waits for the next signal and returns its payload.
    ///
    /// `Ok(None)` means the source is closed and no further signals will
    /// arrive.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// Releases the subscription.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// `LISTEN` subscription on a dedicated PostgreSQL connection.
pub struct PgChangeListener {
    listener: PgListener,
    channel: String,
}

impl PgChangeListener {
    /// Opens a listener connection from `pool` and subscribes to `channel`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the connection or `LISTEN` fails.
    pub async fn connect(pool: &PgPool, channel: &str) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await.map_err(database_error)?;
        listener.listen(channel).await.map_err(database_error)?;
        info!(channel, "listening for outbox notifications");
        Ok(Self { listener, channel: channel.to_string() })
    }

    /// Channel this listener is subscribed to.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

fn database_error(err: sqlx::Error) -> DeliveryError {
    DeliveryError::from(CoreError::from(err))
}

impl ChangeNotifications for PgChangeListener {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            match self.listener.recv().await {
                Ok(notification) => {
                    debug!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        "notification received"
                    );
                    Ok(Some(notification.payload().to_string()))
                },
                Err(sqlx::Error::PoolClosed) => Ok(None),
                Err(e) => Err(database_error(e)),
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.listener.unlisten_all().await {
                warn!(channel = %self.channel, error = %e, "failed to release subscription");
            } else {
                info!(channel = %self.channel, "notification subscription released");
            }
        })
    }
}

impl ChangeNotifications for mpsc::Receiver<String> {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move { Ok(mpsc::Receiver::recv(self).await) })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        mpsc::Receiver::close(self);
        Box::pin(async {})
    }
}
