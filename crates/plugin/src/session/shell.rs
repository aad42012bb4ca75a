//! Interactive shell session handler.
//!
//! Three cooperative pumps per session: keyboard input chunked into stream
//! data messages, a 500 ms terminal-size poller, and POSIX control-signal
//! translation into the control bytes the remote shell expects. Incoming
//! output payloads are written to stdout unmodified.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, error};

use protocol::error::Result;
use protocol::message::PayloadType;
use protocol::payload::SizeData;

use crate::config;
use crate::datachannel::DataChannel;
use crate::session::{SessionContext, SessionHandler};

/// Size reported when the terminal cannot be queried, e.g. when running
/// without a tty.
const FALLBACK_SIZE: SizeData = SizeData {
    cols: 300,
    rows: 100,
};

/// Control bytes sent for intercepted signals. The byte values are the
/// contract; SIGINT is Ctrl+C, SIGQUIT is Ctrl+\, SIGTSTP is Ctrl+Z.
#[cfg(unix)]
const SIGINT_BYTE: u8 = 0x03;
#[cfg(unix)]
const SIGQUIT_BYTE: u8 = 0x1c;
#[cfg(unix)]
const SIGTSTP_BYTE: u8 = 0x1a;

/// Session handler for `Standard_Stream` sessions.
#[derive(Default)]
pub struct ShellSession {
    raw_mode_enabled: AtomicBool,
    data_channel: StdMutex<Option<Arc<DataChannel>>>,
}

impl ShellSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn restore_terminal(&self) {
        if self.raw_mode_enabled.swap(false, Ordering::SeqCst) {
            let _ = terminal::disable_raw_mode();
        }
    }
}

#[async_trait]
impl SessionHandler for ShellSession {
    fn name(&self) -> &'static str {
        config::SHELL_PLUGIN_NAME
    }

    fn initialize(&self, context: &SessionContext) -> Result<()> {
        *self.data_channel.lock().expect("data channel lock") =
            Some(context.data_channel.clone());
        context.data_channel.register_output_stream_handler(
            Arc::new(|_channel, message| {
                let mut stdout = std::io::stdout();
                stdout.write_all(&message.payload)?;
                stdout.flush()?;
                Ok(true)
            }),
            true,
        );
        Ok(())
    }

    async fn run(&self, context: &SessionContext) -> Result<()> {
        if terminal::enable_raw_mode().is_ok() {
            self.raw_mode_enabled.store(true, Ordering::SeqCst);
        } else {
            debug!("could not switch terminal to raw mode");
        }

        spawn_resize_poller(context.data_channel.clone());
        #[cfg(unix)]
        spawn_signal_translators(context.data_channel.clone());

        let result = pump_keyboard_input(&context.data_channel).await;
        self.restore_terminal();
        result
    }

    fn stop(&self) {
        self.restore_terminal();
        if let Some(channel) = self.data_channel.lock().expect("data channel lock").clone() {
            channel.end_session();
        }
    }
}

/// Reads keyboard input off a blocking thread and forwards it as stream
/// data, checking once a second whether the session has ended.
async fn pump_keyboard_input(data_channel: &Arc<DataChannel>) -> Result<()> {
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(32);
    spawn_keyboard_reader(input_tx);

    let mut liveness = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = liveness.tick() => {
                if data_channel.is_session_ended() {
                    return Ok(());
                }
            }
            chunk = input_rx.recv() => {
                let Some(chunk) = chunk else { return Ok(()) };
                data_channel
                    .send_input_data(PayloadType::Output, &chunk)
                    .await?;
            }
        }
    }
}

/// Raw-mode stdin reader: chunked byte reads straight off the terminal.
#[cfg(unix)]
fn spawn_keyboard_reader(input_tx: mpsc::Sender<Vec<u8>>) {
    use std::io::Read;

    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; config::STDIN_BUFFER_LIMIT];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if input_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("reading stdin failed: {e}");
                    break;
                }
            }
        }
    });
}

/// Console key reader: special keys are translated to the ANSI escape
/// sequences the remote shell expects.
#[cfg(windows)]
fn spawn_keyboard_reader(input_tx: mpsc::Sender<Vec<u8>>) {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

    std::thread::spawn(move || loop {
        let Ok(event) = event::read() else { break };
        let Event::Key(key) = event else { continue };
        if key.kind == KeyEventKind::Release {
            continue;
        }
        let bytes: Vec<u8> = match key.code {
            KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
                vec![(c.to_ascii_uppercase() as u8) & 0x1f]
            }
            KeyCode::Char(c) => c.to_string().into_bytes(),
            KeyCode::Enter => b"\r".to_vec(),
            KeyCode::Tab => b"\t".to_vec(),
            KeyCode::Backspace => vec![0x7f],
            KeyCode::Esc => vec![27],
            KeyCode::Up => vec![27, 79, 65],
            KeyCode::Down => vec![27, 79, 66],
            KeyCode::Right => vec![27, 79, 67],
            KeyCode::Left => vec![27, 79, 68],
            KeyCode::F(1) => vec![27, 79, 80],
            KeyCode::F(2) => vec![27, 79, 81],
            KeyCode::F(3) => vec![27, 79, 82],
            KeyCode::F(4) => vec![27, 79, 83],
            KeyCode::F(5) => vec![27, 91, 49, 53, 126],
            KeyCode::F(6) => vec![27, 91, 49, 55, 126],
            KeyCode::F(7) => vec![27, 91, 49, 56, 126],
            KeyCode::F(8) => vec![27, 91, 49, 57, 126],
            KeyCode::F(9) => vec![27, 91, 50, 48, 126],
            KeyCode::F(10) => vec![27, 91, 50, 49, 126],
            // F11 has no byte-sequence mapping.
            KeyCode::F(12) => vec![27, 91, 50, 52, 126],
            KeyCode::Home => vec![27, 91, 72],
            KeyCode::End => vec![27, 91, 70],
            KeyCode::Insert => vec![27, 91, 50, 126],
            KeyCode::Delete => vec![27, 91, 51, 126],
            KeyCode::PageUp => vec![27, 91, 53, 126],
            KeyCode::PageDown => vec![27, 91, 54, 126],
            _ => continue,
        };
        if input_tx.blocking_send(bytes).is_err() {
            break;
        }
    });
}

/// Polls the terminal size every 500 ms and reports changes as `Size`
/// payloads.
fn spawn_resize_poller(data_channel: Arc<DataChannel>) {
    tokio::spawn(async move {
        let mut last_size = SizeData::default();
        let mut ticker = tokio::time::interval(config::RESIZE_SLEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if data_channel.is_session_ended() {
                break;
            }

            let size = match terminal::size() {
                Ok((cols, rows)) => SizeData {
                    cols: cols as u32,
                    rows: rows as u32,
                },
                Err(e) => {
                    debug!(
                        "could not get terminal size ({e}), using {}x{}",
                        FALLBACK_SIZE.cols, FALLBACK_SIZE.rows
                    );
                    FALLBACK_SIZE
                }
            };
            if size == last_size {
                continue;
            }
            last_size = size;

            match serde_json::to_vec(&size) {
                Ok(payload) => {
                    debug!("sending terminal size {}x{}", size.cols, size.rows);
                    if let Err(e) = data_channel
                        .send_input_data(PayloadType::Size, &payload)
                        .await
                    {
                        error!("failed to send size data: {e}");
                    }
                }
                Err(e) => error!("cannot serialize size data: {e}"),
            }
        }
    });
}

/// Forwards intercepted signals as the matching control bytes.
#[cfg(unix)]
fn spawn_signal_translators(data_channel: Arc<DataChannel>) {
    use tokio::signal::unix::{signal, SignalKind};

    let translations = [
        (SignalKind::interrupt(), SIGINT_BYTE),
        (SignalKind::quit(), SIGQUIT_BYTE),
        (SignalKind::from_raw(libc::SIGTSTP), SIGTSTP_BYTE),
    ];

    for (kind, byte) in translations {
        let channel = data_channel.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = signal(kind) else {
                error!("failed to register signal handler");
                return;
            };
            while stream.recv().await.is_some() {
                if channel.is_session_ended() {
                    break;
                }
                if let Err(e) = channel.send_input_data(PayloadType::Output, &[byte]).await {
                    error!("failed to send control signal: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datachannel::test_support::test_channel;

    #[cfg(unix)]
    #[test]
    fn test_control_signal_bytes() {
        assert_eq!(SIGINT_BYTE, 0x03);
        assert_eq!(SIGQUIT_BYTE, 0x1c);
        assert_eq!(SIGTSTP_BYTE, 0x1a);
    }

    #[tokio::test]
    async fn test_initialize_registers_session_specific_handler() {
        use crate::datachannel::test_support::agent_frame;

        let (channel, transport) = test_channel();
        channel.set_session_type(config::SHELL_PLUGIN_NAME);

        let session = ShellSession::new();
        let context = SessionContext {
            session_id: "sess-1".to_string(),
            target_id: "i-123".to_string(),
            data_channel: channel.clone(),
            session_properties: serde_json::Value::Null,
            agent_version: "3.1.0.0".to_string(),
        };
        session.initialize(&context).unwrap();

        // With the session-specific handler registered, output frames are
        // consumed and acknowledged.
        let frame = agent_frame(0, PayloadType::Output, b"");
        channel.handle_incoming(&frame).await;
        assert_eq!(channel.expected_sequence_number(), 1);
        assert_eq!(transport.sent_acknowledges().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_the_session() {
        let (channel, _transport) = test_channel();
        let session = ShellSession::new();
        let context = SessionContext {
            session_id: "sess-1".to_string(),
            target_id: "i-123".to_string(),
            data_channel: channel.clone(),
            session_properties: serde_json::Value::Null,
            agent_version: String::new(),
        };
        session.initialize(&context).unwrap();
        session.stop();
        assert!(channel.is_session_ended());
    }
}
