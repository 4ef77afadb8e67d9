use crate::tcp::TcpError;
use tokio::sync::oneshot;

/// What a suspended operation eventually learns.
pub type Outcome = Result<(), TcpError>;

/// The receiving half handed to a suspended caller. A sender dropped
/// without resolving means the wait was superseded or torn down.
pub type Waiter = oneshot::Receiver<Outcome>;

/// One pending promise for one condition. Subscribing again replaces the
/// earlier waiter, so at most one caller is woken per resolution.
#[derive(Debug, Default)]
pub struct Signal(Option<oneshot::Sender<Outcome>>);

impl Signal {
    pub fn subscribe(&mut self) -> Waiter {
        let (send, recv) = oneshot::channel();
        self.0 = Some(send);
        recv
    }

    /// A waiter that is already resolved.
    pub fn ready(outcome: Outcome) -> Waiter {
        let (send, recv) = oneshot::channel();
        // The receiver is alive, sending cannot fail
        let _ = send.send(outcome);
        recv
    }

    /// Resolves the pending waiter, if any. The waiter may have given up
    /// already, which is not an error.
    pub fn resolve(&mut self, outcome: Outcome) {
        if let Some(send) = self.0.take() {
            let _ = send.send(outcome);
        }
    }

    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        self.0.as_ref().map_or(false, |send| !send.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_latest_subscriber() {
        let mut signal = Signal::default();
        let mut first = signal.subscribe();
        let mut second = signal.subscribe();
        assert!(signal.is_waiting());

        signal.resolve(Err(TcpError::ConnectionReset));
        assert!(!signal.is_waiting());
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv(), Ok(Err(TcpError::ConnectionReset)));
    }

    #[test]
    fn ready_waiter() {
        let mut waiter = Signal::ready(Ok(()));
        assert_eq!(waiter.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn dropped_waiter_is_not_waiting() {
        let mut signal = Signal::default();
        drop(signal.subscribe());
        assert!(!signal.is_waiting());
        signal.resolve(Ok(()));
    }
}
