//! A scripted [`ProcessRunner`] used by the archiver and restorer tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::RunError;
use crate::runner::ProcessRunner;

/// One recorded invocation of the mock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: String,
    pub args: Vec<String>,
}

/// A [`ProcessRunner`] that never spawns anything: it records every call
/// and replays scripted exit codes.
///
/// Failures can be scripted per call order (`with_exit_codes`, for
/// sequential callers) or keyed on an argument (`fail_for_argument`, for
/// parallel callers where the call order is unspecified). Unscripted
/// calls succeed.
#[derive(Debug, Default)]
pub struct MockRunner {
    exit_codes: Mutex<VecDeque<i32>>,
    failures_by_argument: Mutex<HashMap<String, i32>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRunner {
    /// A runner whose every invocation succeeds.
    pub fn succeeding() -> Self {
        MockRunner::default()
    }

    /// A runner that exits with `codes` for the first invocations, in
    /// order, and succeeds afterwards. A code of zero is a success.
    pub fn with_exit_codes(codes: &[i32]) -> Self {
        MockRunner {
            exit_codes: Mutex::new(codes.iter().copied().collect()),
            ..MockRunner::default()
        }
    }

    /// Makes every invocation whose argv contains `argument` exit with
    /// `code`.
    pub fn fail_for_argument(&self, argument: &str, code: i32) {
        self.failures_by_argument
            .lock()
            .unwrap()
            .insert(argument.to_string(), code);
    }

    /// The invocations seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run_streaming(
        &self,
        command: &str,
        args: &[String],
        _env: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        self.calls.lock().unwrap().push(RecordedCall {
            command: command.to_string(),
            args: args.to_vec(),
        });

        let by_argument = self.failures_by_argument.lock().unwrap();
        for arg in args {
            if let Some(code) = by_argument.get(arg) {
                return Err(RunError::ExitCode {
                    command: command.to_string(),
                    code: *code,
                });
            }
        }
        drop(by_argument);

        match self.exit_codes.lock().unwrap().pop_front() {
            None | Some(0) => Ok(()),
            Some(code) => Err(RunError::ExitCode {
                command: command.to_string(),
                code,
            }),
        }
    }
}
