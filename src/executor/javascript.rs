use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

use super::process::run_process;
use super::{ExecutionResult, MessageSink, MessageType};

/// Marks a console record on the interpreter's stdout. Records are written
/// on a line of their own so partial writes by the program cannot run into
/// them. Anything else the program writes directly is plain log output.
const RECORD_MARKER: char = '\u{1e}';

/// Runs in front of the user's code. Replaces the console methods with
/// writers that emit one JSON record per call, then evaluates the source
/// read from stdin in global scope.
const PRELUDE: &str = r#"
const RS = '\u001e';
const render = (v) => {
  if (typeof v === 'object' && v !== null) {
    try { return JSON.stringify(v, null, 2); } catch (_) { return String(v); }
  }
  return String(v);
};
const emit = (type, args) => {
  process.stdout.write('\n' + RS + JSON.stringify({ type, message: args.map(render).join(' ') }) + '\n');
};
for (const type of ['log', 'info', 'warn', 'error']) {
  console[type] = (...args) => emit(type, args);
}
const fault = (e) => {
  const msg = (e && e.message !== undefined) ? e.message : String(e);
  emit('error', ['JavaScript execution error: ' + msg]);
};
process.on('uncaughtException', fault);
process.on('unhandledRejection', fault);
let source = '';
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => { source += chunk; });
process.stdin.on('end', () => {
  try { (0, eval)(source); } catch (e) { fault(e); }
});
"#;

#[derive(Debug, Deserialize)]
struct ConsoleRecord {
    #[serde(rename = "type")]
    message_type: MessageType,
    message: String,
}

/// JavaScript execution in a `node` subprocess, one process per request.
pub struct JavaScriptRunner {
    node_command: String,
    timeout: Duration,
}

impl JavaScriptRunner {
    pub fn new(node_command: &str, timeout: Duration) -> Self {
        Self {
            node_command: node_command.to_string(),
            timeout,
        }
    }

    pub async fn execute(&self, source: &str) -> ExecutionResult {
        let mut sink = MessageSink::new();

        let mut cmd = Command::new(&self.node_command);
        cmd.arg("-e").arg(PRELUDE);

        let output = match run_process(cmd, Some(source.as_bytes()), self.timeout, "JavaScript execution").await {
            Ok(output) => output,
            Err(e) => {
                warn!("JavaScript execution failed: {}", e);
                sink.error(format!("JavaScript execution error: {}", e));
                return ExecutionResult::new(false, sink);
            }
        };

        collect_output(&output.stdout, &mut sink);

        if !output.success {
            let stderr = output.stderr.trim();
            if !stderr.is_empty() {
                sink.error(format!("JavaScript execution error: {}", stderr));
            }
        }

        debug!("JavaScript execution finished with {:?}", output.exit_code);

        // The interpreter ran: faults are reported through the messages
        ExecutionResult::new(true, sink)
    }
}

fn collect_output(stdout: &str, sink: &mut MessageSink) {
    for line in stdout.lines() {
        match parse_record(line) {
            Some((message_type, message)) => sink.push(message_type, message),
            None if !line.trim().is_empty() => sink.log(line),
            None => {}
        }
    }
}

/// A marked line becomes its record. Unmarked or malformed lines are not
/// records.
fn parse_record(line: &str) -> Option<(MessageType, String)> {
    let payload = line.strip_prefix(RECORD_MARKER)?;
    let record: ConsoleRecord = serde_json::from_str(payload).ok()?;
    Some((record.message_type, record.message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node_available() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn runner() -> JavaScriptRunner {
        JavaScriptRunner::new("node", Duration::from_secs(10))
    }

    #[test]
    fn test_parse_record() {
        let line = "\u{1e}{\"type\":\"warn\",\"message\":\"low disk\"}";
        assert_eq!(
            parse_record(line),
            Some((MessageType::Warn, "low disk".to_string()))
        );
        assert_eq!(parse_record("plain output"), None);
        assert_eq!(parse_record("\u{1e}{not json"), None);
        assert_eq!(parse_record("\u{1e}{\"type\":\"debug\",\"message\":\"x\"}"), None);
    }

    #[test]
    fn test_collect_output_mixes_records_and_raw_lines() {
        let stdout = "\u{1e}{\"type\":\"log\",\"message\":\"a\"}\nraw write\n\n\u{1e}{\"type\":\"error\",\"message\":\"b\"}\n";
        let mut sink = MessageSink::new();
        collect_output(stdout, &mut sink);

        let got: Vec<(MessageType, String)> = sink
            .into_messages()
            .into_iter()
            .map(|m| (m.message_type, m.message))
            .collect();
        assert_eq!(
            got,
            vec![
                (MessageType::Log, "a".to_string()),
                (MessageType::Log, "raw write".to_string()),
                (MessageType::Error, "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails() {
        let runner = JavaScriptRunner::new("no-such-node-binary-42", Duration::from_secs(1));
        let result = runner.execute("console.log(1)").await;
        assert!(!result.success);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].message_type, MessageType::Error);
    }

    #[tokio::test]
    async fn test_console_log_arithmetic() {
        if !node_available() {
            eprintln!("node not installed, skipping");
            return;
        }
        let result = runner().execute("console.log(1+1)").await;
        assert!(result.success);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].message_type, MessageType::Log);
        assert_eq!(result.messages[0].message, "2");
    }

    #[tokio::test]
    async fn test_objects_and_levels() {
        if !node_available() {
            return;
        }
        let result = runner()
            .execute("console.info('n', 3); console.warn({a: 1}); console.error(null)")
            .await;
        let got: Vec<(MessageType, String)> = result
            .messages
            .into_iter()
            .map(|m| (m.message_type, m.message))
            .collect();
        assert_eq!(
            got,
            vec![
                (MessageType::Info, "n 3".to_string()),
                (MessageType::Warn, "{\n  \"a\": 1\n}".to_string()),
                (MessageType::Error, "null".to_string()),
            ]
        );
    }

    #[test]
    fn test_collect_output_after_partial_write() {
        let stdout = "abc\n\u{1e}{\"type\":\"error\",\"message\":\"x\"}\n";
        let mut sink = MessageSink::new();
        collect_output(stdout, &mut sink);

        let got: Vec<(MessageType, String)> = sink
            .into_messages()
            .into_iter()
            .map(|m| (m.message_type, m.message))
            .collect();
        assert_eq!(
            got,
            vec![
                (MessageType::Log, "abc".to_string()),
                (MessageType::Error, "x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_stdout_write_keeps_records_intact() {
        if !node_available() {
            return;
        }
        let result = runner()
            .execute("process.stdout.write('abc'); console.error('x')")
            .await;
        let got: Vec<(MessageType, String)> = result
            .messages
            .into_iter()
            .map(|m| (m.message_type, m.message))
            .collect();
        assert_eq!(
            got,
            vec![
                (MessageType::Log, "abc".to_string()),
                (MessageType::Error, "x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_thrown_fault_is_reported() {
        if !node_available() {
            return;
        }
        let result = runner()
            .execute("console.log('before'); throw new Error('boom')")
            .await;
        assert!(result.success);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].message, "before");
        assert_eq!(result.messages[1].message_type, MessageType::Error);
        assert_eq!(result.messages[1].message, "JavaScript execution error: boom");
    }

    #[tokio::test]
    async fn test_runaway_script_times_out() {
        if !node_available() {
            return;
        }
        let runner = JavaScriptRunner::new("node", Duration::from_millis(500));
        let result = runner.execute("while (true) {}").await;
        assert!(!result.success);
        assert!(result.messages[0].message.contains("exceeded"));
    }
}
