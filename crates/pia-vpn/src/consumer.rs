//! Port consumers
//!
//! Applications that listen on the forwarded port (torrent clients and the
//! like). After a bind each one is told the port and then asked which port
//! it actually uses.

use crate::manager::SessionError;
use std::error::Error;
use std::future::Future;
use tracing::{debug, info};

/// An application that must follow the forwarded port
pub trait PortConsumer: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Tell the consumer to use `port`
    fn notify(&self, port: u16) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Port the consumer reports it is using
    fn confirm(&self) -> impl Future<Output = Result<u16, Self::Error>> + Send;
}

impl<C: PortConsumer> PortConsumer for &C {
    type Error = C::Error;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn notify(&self, port: u16) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).notify(port)
    }

    fn confirm(&self) -> impl Future<Output = Result<u16, Self::Error>> + Send {
        (**self).confirm()
    }
}

/// Notify `consumer` of `port` and fail unless it then reports that port
pub async fn confirm_port<C: PortConsumer>(consumer: &C, port: u16) -> Result<(), SessionError> {
    let consumer_error = |source: C::Error| SessionError::Consumer {
        consumer: consumer.name().to_string(),
        source: Box::new(source),
    };

    debug!("Setting {} to port {}", consumer.name(), port);
    consumer.notify(port).await.map_err(consumer_error)?;

    let reported = consumer.confirm().await.map_err(consumer_error)?;
    if reported != port {
        return Err(SessionError::Consistency {
            consumer: consumer.name().to_string(),
            assigned: port,
            reported,
        });
    }

    info!("{} confirmed port {}", consumer.name(), port);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub(crate) struct FakeError(pub &'static str);

    /// Consumer that records the notified port and reports a fixed one
    pub(crate) struct FakeConsumer {
        pub reports: Option<u16>,
        pub notified: Mutex<Vec<u16>>,
    }

    impl FakeConsumer {
        /// Reports whatever it was last told
        pub(crate) fn echo() -> Self {
            Self {
                reports: None,
                notified: Mutex::new(Vec::new()),
            }
        }

        /// Always reports `port`
        pub(crate) fn stuck_at(port: u16) -> Self {
            Self {
                reports: Some(port),
                notified: Mutex::new(Vec::new()),
            }
        }
    }

    impl PortConsumer for FakeConsumer {
        type Error = FakeError;

        fn name(&self) -> &str {
            "fake"
        }

        async fn notify(&self, port: u16) -> Result<(), FakeError> {
            self.notified.lock().unwrap().push(port);
            Ok(())
        }

        async fn confirm(&self) -> Result<u16, FakeError> {
            match self.reports {
                Some(port) => Ok(port),
                None => self
                    .notified
                    .lock()
                    .unwrap()
                    .last()
                    .copied()
                    .ok_or(FakeError("never notified")),
            }
        }
    }

    struct Offline;

    impl PortConsumer for Offline {
        type Error = FakeError;

        fn name(&self) -> &str {
            "offline"
        }

        async fn notify(&self, _port: u16) -> Result<(), FakeError> {
            Err(FakeError("connection refused"))
        }

        async fn confirm(&self) -> Result<u16, FakeError> {
            unreachable!("confirm after failed notify")
        }
    }

    #[tokio::test]
    async fn test_confirmed() {
        let consumer = FakeConsumer::echo();
        confirm_port(&consumer, 51413).await.unwrap();
        assert_eq!(*consumer.notified.lock().unwrap(), vec![51413]);
    }

    #[tokio::test]
    async fn test_mismatch_names_both_ports() {
        let err = confirm_port(&FakeConsumer::stuck_at(6881), 51413)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Consistency {
                assigned: 51413,
                reported: 6881,
                ..
            }
        ));
        let text = err.to_string();
        assert!(text.contains("51413"));
        assert!(text.contains("6881"));
    }

    #[tokio::test]
    async fn test_notify_failure() {
        let err = confirm_port(&Offline, 51413).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));

        let source = err.source().unwrap();
        assert!(source.downcast_ref::<FakeError>().is_some());
    }
}
