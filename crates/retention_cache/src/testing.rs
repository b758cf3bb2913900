// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test utilities shared by the unit tests.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

/// Formatted `tracing` output collected on the current thread.
#[derive(Clone)]
pub(crate) struct LogCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Routes events of the current thread into a fresh capture until the guard drops.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self { bytes: Arc::default() };
        let layer = tracing_subscriber::fmt::layer().with_writer(capture.clone()).with_ansi(false);
        let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
        (capture, guard)
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn assert_logged(&self, needle: &str) {
        let output = self.output();
        assert!(output.contains(needle), "`{needle}` was not logged, got:\n{output}");
    }
}

impl MakeWriter<'_> for LogCapture {
    type Writer = Self;

    fn make_writer(&self) -> Self {
        self.clone()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lets spawned timer tasks run until they block again.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub(crate) const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
