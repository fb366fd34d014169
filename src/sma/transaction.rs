use crate::prelude::*;

pub const FIRST_PACKET_ID: u16 = 0x8000;
/// Retries after the initial attempt of a failed exchange.
pub const MAX_RETRIES: u32 = 3;

/// Per-session packet id, advanced once per completed request/response
/// round. Wraps back to [`FIRST_PACKET_ID`] after `0xFFFF`.
#[derive(Debug)]
pub struct TransactionCounter(u16);

impl Default for TransactionCounter {
    fn default() -> Self {
        Self(FIRST_PACKET_ID)
    }
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u16 {
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = FIRST_PACKET_ID;
    }

    /// Opens a transaction; the counter advances when it is dropped, however
    /// the exchange ends. Only one can be open at a time.
    pub fn begin(&mut self) -> Transaction<'_> {
        let id = self.0;
        Transaction { counter: self, id }
    }

    fn advance(&mut self) {
        self.0 = match self.0 {
            0xFFFF => FIRST_PACKET_ID,
            n => n + 1,
        };
    }
}

pub struct Transaction<'a> {
    counter: &'a mut TransactionCounter,
    id: u16,
}

impl Transaction<'_> {
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.counter.advance();
    }
}

/// Linear backoff between attempts: sleeps `n` seconds before retry `n`.
#[derive(Debug)]
pub struct Backoff {
    retries: u32,
    max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MAX_RETRIES)
    }
}

impl Backoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retries: 0,
            max_retries,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Decides whether to retry after `error`, sleeping first if so.
    pub async fn retry(&mut self, what: &str, error: &Error) -> bool {
        if !error.is_transient() || self.retries >= self.max_retries {
            return false;
        }

        self.retries += 1;
        warn!(
            "{} failed ({}), retry {}/{} in {}s",
            what, error, self.retries, self.max_retries, self.retries
        );
        tokio::time::sleep(Duration::from_secs(self.retries as u64)).await;
        true
    }
}

/// Runs an exchange until it succeeds, fails permanently, or the default
/// [`Backoff`] gives up; evaluates to the last result.
#[macro_export]
macro_rules! retrying {
    ($what:expr, $attempt:expr) => {{
        let mut backoff = $crate::sma::transaction::Backoff::default();
        loop {
            match $attempt.await {
                Ok(r) => break Ok(r),
                Err(e) => {
                    if !backoff.retry($what, &e).await {
                        break Err(e);
                    }
                }
            }
        }
    }};
}
