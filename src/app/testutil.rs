use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::app::adb::runner::{CommandExecutor, CommandOutput, CommandSpec};
use crate::app::error::AppError;

type Responder = dyn Fn(&CommandSpec) -> Result<CommandOutput, AppError> + Send + Sync;

/// Scripted stand-in for the process executor. Records every invocation as
/// `program arg1 arg2 ...` and answers through the supplied responder.
pub struct ScriptedExecutor {
    responder: Box<Responder>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn with_responder(
        responder: impl Fn(&CommandSpec) -> Result<CommandOutput, AppError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn ok_for_all(stdout: &str) -> Arc<Self> {
        let stdout = stdout.to_string();
        Self::with_responder(move |_| Self::ok_output(&stdout))
    }

    pub fn ok_output(stdout: &str) -> Result<CommandOutput, AppError> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    pub fn failed_output(stderr: &str, exit_code: i32) -> Result<CommandOutput, AppError> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, AppError> {
        let mut joined = if spec.args.is_empty() {
            spec.program.clone()
        } else {
            format!("{} {}", spec.program, spec.args.join(" "))
        };
        if let Some(stdin) = &spec.stdin {
            joined.push_str(" << ");
            joined.push_str(&String::from_utf8_lossy(stdin).replace('\n', "\\n"));
        }
        self.calls.lock().expect("call log poisoned").push(joined);
        (self.responder)(spec)
    }
}
