// bioamp test application -- CLI tool for exercising the board driver
// against real hardware or a scripted mock board.
//
// Usage:
//   bioamp-test-app list-ports
//   bioamp-test-app --port /dev/ttyUSB0 info
//   bioamp-test-app --port /dev/ttyUSB0 --baud 230400 stream --duration 10
//   bioamp-test-app --daisy stream --duration 60 --csv recording.csv --channel 3
//   bioamp-test-app --port /dev/ttyUSB0 radio scan
//   bioamp-test-app --port /dev/ttyUSB0 radio set 7
//   bioamp-test-app --port /dev/ttyUSB0 impedance --channel 2 --p
//   bioamp-test-app --mock stream --samples 500
//
// Exit codes:
//   0  success
//   1  any other failure
//   2  no board found, or port discovery unsupported on this platform
//   3  the board stalled and could not be reconnected

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bioamp_board::commands::TestSignal;
use bioamp_board::decoder::encode_frame;
use bioamp_board::link::LinkTiming;
use bioamp_board::resolver::candidate_paths;
use bioamp_board::{BaudRate, Board, BoardBuilder, StreamExit};
use bioamp_core::{CsvColumn, CsvSampleWriter, Error as BoardError, LinkEvent, Sample};
use bioamp_test_harness::{MockConnector, MockTransport};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// bioamp test application -- drives a bioamplifier board from the command line.
#[derive(Parser)]
#[command(name = "bioamp-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3). Probed for when omitted.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate to switch to after the handshake: 115200, 230400 or 921600.
    #[arg(long, default_value_t = 115_200, value_parser = parse_baud)]
    baud: u32,

    /// The 8-channel expansion module is fitted.
    #[arg(long)]
    daisy: bool,

    /// Deliver raw ADC counts instead of microvolts.
    #[arg(long)]
    raw: bool,

    /// Give up after this many reconnect attempts (default: retry forever).
    #[arg(long)]
    max_reconnects: Option<u32>,

    /// Configuration string re-sent to the board after every reconnect.
    #[arg(long)]
    init: Option<String>,

    /// Log filter, e.g. "info" or "bioamp_board=debug".
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Use a scripted mock board instead of a serial port.
    /// Useful for verifying CLI parsing and builder wiring without hardware.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

fn parse_baud(s: &str) -> std::result::Result<u32, String> {
    let bps: u32 = s.parse().map_err(|e| format!("invalid baud rate: {e}"))?;
    BaudRate::try_from(bps)
        .map(|b| b.bits_per_second())
        .map_err(|e| e.to_string())
}

#[derive(Subcommand)]
enum Command {
    /// List the serial ports that would be probed for a board.
    ListPorts,

    /// Connect and print board information.
    Info,

    /// Stream samples to stdout or a CSV file.
    Stream {
        /// Duration in seconds (0 = until the sample limit or forever).
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Stop after this many delivered samples.
        #[arg(long)]
        samples: Option<u64>,

        /// Write one CSV row per sample to this file instead of stdout.
        #[arg(long)]
        csv: Option<PathBuf>,

        /// 1-based channel recorded in the CSV file.
        #[arg(long, default_value_t = 1)]
        channel: usize,

        /// Enable the board's on-board filters before streaming.
        #[arg(long)]
        filters: bool,

        /// Route an internal test signal to all inputs.
        #[arg(long)]
        test_signal: Option<String>,

        /// Print link events while streaming.
        #[arg(long)]
        events: bool,
    },

    /// Radio link operations.
    Radio {
        #[command(subcommand)]
        action: RadioAction,
    },

    /// Start an impedance measurement on one channel.
    Impedance {
        /// 1-based channel number.
        #[arg(long)]
        channel: u8,

        /// Apply the test current to the positive input.
        #[arg(long)]
        p: bool,

        /// Apply the test current to the negative input.
        #[arg(long)]
        n: bool,
    },

    /// Stop the board and discard anything it still has buffered.
    Flush,
}

#[derive(Subcommand)]
enum RadioAction {
    /// Print the current radio channel.
    Get,
    /// Move host and board to a channel (1-25).
    Set { channel: u8 },
    /// Move only the host dongle to a channel (1-25).
    Override { channel: u8 },
    /// Ask whether the host can reach the board.
    Status,
    /// Try every channel until the board answers.
    Scan,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_test_signal(name: &str) -> Result<TestSignal> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "ground" => TestSignal::Ground,
        "vcc" => TestSignal::Vcc,
        "pulse1x-slow" => TestSignal::Pulse1xSlow,
        "pulse1x-fast" => TestSignal::Pulse1xFast,
        "pulse2x-slow" => TestSignal::Pulse2xSlow,
        "pulse2x-fast" => TestSignal::Pulse2xFast,
        other => bail!(
            "unknown test signal '{other}' (expected ground, vcc, pulse1x-slow, \
             pulse1x-fast, pulse2x-slow, pulse2x-fast)"
        ),
    })
}

/// Map a failure onto the documented exit codes.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    let board_error = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<BoardError>());
    match board_error {
        Some(BoardError::NoDeviceFound | BoardError::PlatformUnsupported(_)) => 2,
        Some(BoardError::DeviceStalled | BoardError::ReconnectFailed { .. }) => 3,
        _ => 1,
    }
}

fn format_event(event: &LinkEvent) -> String {
    match event {
        LinkEvent::Connected { port, firmware } => format!("connected to {port} (firmware {firmware})"),
        LinkEvent::StreamingStarted => "streaming started".into(),
        LinkEvent::StreamingStopped => "streaming stopped".into(),
        LinkEvent::PacketDropped { sequence_id, found } => {
            format!("dropped packet {sequence_id} (end byte {found:#04x})")
        }
        LinkEvent::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
        LinkEvent::Reconnected => "reconnected".into(),
        LinkEvent::ReconnectFailed { attempt } => format!("reconnect attempt {attempt} failed"),
        LinkEvent::RadioChannel { channel } => format!("radio channel {channel}"),
        LinkEvent::Disconnected => "disconnected".into(),
    }
}

// ---------------------------------------------------------------------------
// Mock board scripting
// ---------------------------------------------------------------------------

const MOCK_PORT: &str = "/dev/mock";
const MOCK_BANNER: &[u8] = b"OpenBCI V3 8-16 channel\nFirmware: v3.1.2\n$$$";

/// Synthetic frames: a slow triangle wave on every channel.
fn mock_frames(count: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    for n in 0..count {
        let phase = (n % 250) as i32;
        let value = if phase < 125 { phase } else { 250 - phase } * 1000;
        bytes.extend_from_slice(&encode_frame(n as u8, &[value; 8], &[0, 0, 16]));
    }
    bytes
}

fn script_mock(cli: &Cli) -> Result<MockTransport> {
    let mut mock = MockTransport::new();
    mock.expect(b"v", MOCK_BANNER);
    mock.expect(&[0xF0, 0x00], b"Success: Host and Device on Channel Number: 1$$$");
    mock.expect(&BaudRate::try_from(cli.baud)?.switch_command(), b"");
    match &cli.command {
        Command::Info => {
            mock.expect(b"?", b"Board ADS Registers\nADS_ID, 00, 3E\n$$$");
        }
        Command::Stream {
            samples,
            filters,
            test_signal,
            ..
        } => {
            if *filters {
                mock.expect(b"f", b"");
            }
            if let Some(name) = test_signal {
                mock.expect(&[parse_test_signal(name)?.command()], b"");
            }
            let samples = samples.unwrap_or(250);
            let frames = if cli.daisy { samples * 2 } else { samples };
            mock.expect(b"b", &mock_frames(frames + 2));
            mock.expect(b"s", b"");
        }
        Command::Flush => mock.expect(b"s", b""),
        _ => bail!("this command is not supported with --mock"),
    }
    Ok(mock)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

async fn connect(cli: &Cli) -> Result<Board> {
    let mut builder = BoardBuilder::new()
        .baud_rate(BaudRate::try_from(cli.baud)?)
        .daisy(cli.daisy)
        .scaled_output(!cli.raw)
        .max_reconnect_attempts(cli.max_reconnects);
    if let Some(init) = &cli.init {
        builder = builder.init_board_bytes(init.as_bytes());
    }

    if cli.mock {
        let mut confirm = MockTransport::new();
        confirm.expect(b"v", MOCK_BANNER);
        let connector = MockConnector::new()
            .with(MOCK_PORT, script_mock(cli)?)
            .with(MOCK_PORT, confirm);
        let board = builder
            .serial_port(MOCK_PORT)
            .timing(LinkTiming::immediate())
            .build_with_connector(Arc::new(connector))
            .await
            .context("failed to build board with mock transport")?;
        info!(firmware = %board.firmware(), "connected (mock transport)");
        return Ok(board);
    }

    if let Some(port) = &cli.port {
        builder = builder.serial_port(port);
    }
    let board = builder.build().await.context("failed to connect to board")?;
    info!(
        port = board.port(),
        baud_rate = cli.baud,
        firmware = %board.firmware(),
        "connected"
    );
    Ok(board)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list_ports() -> Result<()> {
    let ports = candidate_paths().context("port discovery failed")?;
    if ports.is_empty() {
        println!("No candidate serial ports found.");
        return Ok(());
    }
    for port in &ports {
        println!("{port}");
    }
    println!();
    println!("{} ports.", ports.len());
    Ok(())
}

async fn cmd_info(board: &Board) -> Result<()> {
    println!("Board Information");
    println!("  Port:           {}", board.port());
    println!("  Firmware:       {}", board.firmware());
    println!("  Daisy module:   {}", board.is_daisy());
    println!("  Sample rate:    {} Hz", board.sample_rate());
    println!("  EEG channels:   {}", board.eeg_channel_count());
    println!("  Aux channels:   {}", board.aux_channel_count());
    match board.radio().assignment().await.current() {
        Some(channel) => println!("  Radio channel:  {channel}"),
        None => println!("  Radio channel:  unknown"),
    }
    println!();
    match board.register_settings().await? {
        Some(registers) => println!("{}", registers.trim_end_matches("$$$").trim_end()),
        None => println!("(no register dump received)"),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_stream(
    board: &Board,
    duration_secs: u64,
    samples: Option<u64>,
    csv: Option<&PathBuf>,
    channel: usize,
    filters: bool,
    test_signal: Option<&str>,
    print_events: bool,
) -> Result<()> {
    if channel == 0 || channel > board.eeg_channel_count() {
        bail!(
            "channel must be between 1 and {}",
            board.eeg_channel_count()
        );
    }
    if filters {
        board.enable_filters().await?;
    }
    if let Some(name) = test_signal {
        board.test_signal(parse_test_signal(name)?).await?;
    }

    let event_task = print_events.then(|| {
        let mut rx = board.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => eprintln!("[event] {}", format_event(&event)),
                    Err(RecvError::Lagged(n)) => warn!(missed = n, "event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let control = board.control();
    let mut session = board.session();
    if let Some(limit) = samples {
        let mut delivered = 0u64;
        let control = control.clone();
        session.add_sink(move |_: &Sample| {
            delivered += 1;
            if delivered == limit {
                control.request_stop();
            }
        });
    }

    let column = if filters { CsvColumn::Filtered } else { CsvColumn::Raw };
    match csv {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            let writer = CsvSampleWriter::new(BufWriter::new(file), channel - 1, column)?;
            session.add_sink(writer);
            println!("Recording channel {channel} to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            session.add_sink(move |sample: &Sample| {
                let values: Vec<String> =
                    sample.channels.iter().map(|v| format!("{v:.3}")).collect();
                let _ = writeln!(stdout.lock(), "{:3} {}", sample.sequence_id, values.join(" "));
            });
        }
    }

    let limit = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));
    let started = Instant::now();
    let exit = board.stream(&mut session, limit).await;
    // Dropping the session flushes the CSV writer.
    drop(session);

    if let Some(task) = event_task {
        task.abort();
    }
    let exit = exit?;
    let (_, total_dropped) = board.dropped_packets().await;
    println!(
        "Streamed for {:.1} s ({}), {} packets dropped.",
        started.elapsed().as_secs_f64(),
        match exit {
            StreamExit::Stopped => "stopped",
            StreamExit::DurationElapsed => "duration elapsed",
        },
        total_dropped
    );
    Ok(())
}

async fn cmd_radio(board: &Board, action: &RadioAction) -> Result<()> {
    let radio = board.radio();
    match action {
        RadioAction::Get => match radio.channel().await? {
            Some(channel) => println!("Radio channel: {channel}"),
            None => println!("Radio channel: unknown (no usable reply)"),
        },
        RadioAction::Set { channel } => {
            let reply = radio.set_channel(*channel).await?;
            println!("{}", reply.trim_end_matches("$$$"));
        }
        RadioAction::Override { channel } => {
            radio.set_host_override(*channel).await?;
            println!("Host dongle moved to channel {channel}");
        }
        RadioAction::Status => {
            let reply = radio.status().await?;
            println!("{}", reply.trim_end_matches("$$$"));
        }
        RadioAction::Scan => {
            println!("Scanning radio channels...");
            let channel = radio.scan_channels().await?;
            println!("Board answered on channel {channel}");
        }
    }
    Ok(())
}

async fn cmd_impedance(board: &Board, channel: u8, p: bool, n: bool) -> Result<()> {
    match board.impedance_measurement(channel, p, n).await? {
        Some(reply) => println!("{}", reply.trim_end_matches("$$$").trim_end()),
        None => println!("Impedance command sent (no reply)"),
    }
    Ok(())
}

async fn cmd_flush(board: &Board) -> Result<()> {
    let discarded = board.flush().await?;
    println!("Discarded {discarded} bytes");
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

async fn run(cli: Cli) -> Result<()> {
    // `list-ports` does not need a board connection.
    if matches!(cli.command, Command::ListPorts) {
        return cmd_list_ports();
    }

    let board = connect(&cli).await?;
    let result = match &cli.command {
        Command::Info => cmd_info(&board).await,
        Command::Stream {
            duration,
            samples,
            csv,
            channel,
            filters,
            test_signal,
            events,
        } => {
            cmd_stream(
                &board,
                *duration,
                *samples,
                csv.as_ref(),
                *channel,
                *filters,
                test_signal.as_deref(),
                *events,
            )
            .await
        }
        Command::Radio { action } => cmd_radio(&board, action).await,
        Command::Impedance { channel, p, n } => cmd_impedance(&board, *channel, *p, *n).await,
        Command::Flush => cmd_flush(&board).await,
        Command::ListPorts => unreachable!("list-ports handled above"),
    };
    board.disconnect().await.ok();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_failures_exit_with_two() {
        let e = anyhow::Error::new(BoardError::NoDeviceFound).context("failed to connect to board");
        assert_eq!(exit_code_for(&e), 2);
        let e = anyhow::Error::new(BoardError::PlatformUnsupported("plan9".into()));
        assert_eq!(exit_code_for(&e), 2);
    }

    #[test]
    fn unrecovered_stalls_exit_with_three() {
        let e = anyhow::Error::new(BoardError::ReconnectFailed {
            attempts: 3,
            source: Box::new(BoardError::DeviceStalled),
        });
        assert_eq!(exit_code_for(&e), 3);
        assert_eq!(exit_code_for(&anyhow::Error::new(BoardError::DeviceStalled)), 3);
    }

    #[test]
    fn other_failures_exit_with_one() {
        assert_eq!(exit_code_for(&anyhow::anyhow!("bad csv path")), 1);
        assert_eq!(exit_code_for(&anyhow::Error::new(BoardError::Timeout)), 1);
    }

    #[test]
    fn baud_flag_accepts_supported_rates_only() {
        assert_eq!(parse_baud("230400"), Ok(230_400));
        assert!(parse_baud("57600").is_err());
        assert!(parse_baud("fast").is_err());
    }

    #[test]
    fn cli_parses_stream_options() {
        let cli = Cli::try_parse_from([
            "bioamp-test-app",
            "--daisy",
            "--baud",
            "921600",
            "stream",
            "--duration",
            "5",
            "--csv",
            "out.csv",
            "--channel",
            "12",
        ])
        .unwrap();
        assert!(cli.daisy);
        assert_eq!(cli.baud, 921_600);
        match cli.command {
            Command::Stream {
                duration, channel, ..
            } => {
                assert_eq!(duration, 5);
                assert_eq!(channel, 12);
            }
            _ => panic!("expected stream command"),
        }
    }

    #[test]
    fn mock_frames_are_whole_frames() {
        assert_eq!(mock_frames(4).len(), 4 * bioamp_board::protocol::FRAME_LEN);
    }

    #[tokio::test]
    async fn mock_board_streams_requested_samples() {
        let cli = Cli::try_parse_from(["bioamp-test-app", "--mock", "stream", "--samples", "20"])
            .unwrap();
        run(cli).await.unwrap();
    }
}
