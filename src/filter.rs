//! Message delivery through an external filter program.
//!
//! The message is written into the filter's stdin by a background task
//! and the filter's stdout is copied to the real destination. The
//! writer task performs no final-hop transformations: CRLF conversion,
//! line-start escaping, chunk framing, and the terminating dot are all
//! applied here, to the filter's output, so nothing is escaped twice.

use std::{
    io,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::{io::AsyncReadExt, process::Command, task::JoinHandle};

use crate::{
    assembler::ChunkFlags,
    context::TransportContext,
    error::{FilterError, TransportError},
    message::MessageSource,
    options::{FilterConfig, TransportOptions},
    pipeline::write_direct,
    writer::Destination,
};

/// Read size for copying the filter's output.
const FILTER_READ_SIZE: usize = 8 * 1024;

/// What the writer task hands back once the message has been fed to
/// the filter's stdin.
#[derive(Debug)]
struct WriterReport {
    /// The outcome of writing into the filter.
    result: Result<(), TransportError>,
    /// Bytes delivered to the filter's stdin.
    bytes: u64,
    /// Time spent feeding the filter.
    timing: Duration,
}

/// Write a spooled message through the configured filter program.
pub(crate) async fn write_filtered(
    ctx: &mut TransportContext,
    source: MessageSource,
    options: &TransportOptions,
) -> Result<(), TransportError> {
    let Some(config) = &options.filter else {
        let mut source = source;
        return write_direct(ctx, &mut source, options).await;
    };

    ctx.reset();

    let mut child = spawn_filter(config).map_err(FilterError::Spawn)?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| FilterError::Spawn(io::Error::other("filter stdin unavailable")))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| FilterError::Spawn(io::Error::other("filter stdout unavailable")))?;

    let writer = spawn_writer(ctx, stdin, source, options);

    // Copy the filter's output to the destination, a block at a time.
    // Every read gets its own deadline so a wedged filter cannot hold
    // the delivery open indefinitely.
    let deadline = config.timeout();
    let mut block = vec![0_u8; FILTER_READ_SIZE];
    let mut last_was_newline = true;
    let mut failure: Option<TransportError> = None;

    loop {
        let read = tokio::time::timeout(deadline, stdout.read(&mut block)).await;
        match read {
            Err(_) => {
                failure = Some(FilterError::TimedOut(deadline).into());
                break;
            }
            Ok(Err(error)) => {
                failure = Some(error.into());
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(count)) => {
                last_was_newline = block[count - 1] == b'\n';
                if let Err(error) = ctx.write_chunk(&block[..count], false).await {
                    failure = Some(error);
                    break;
                }
            }
        }
    }

    // Single teardown point: whatever happened above, the child is
    // reaped and the writer task is collected exactly once.
    if failure.is_some() {
        drop(child.start_kill());
        writer.abort();
    }

    match child.wait().await {
        Ok(status) if !status.success() && failure.is_none() => {
            failure = Some(FilterError::Exit(status).into());
        }
        Err(error) if failure.is_none() => {
            failure = Some(error.into());
        }
        _ => {}
    }

    match writer.await {
        Ok(report) => {
            tracing::debug!(
                bytes = report.bytes,
                elapsed = ?report.timing,
                ok = report.result.is_ok(),
                "filter writer finished"
            );
            if failure.is_none()
                && let Err(error) = report.result
            {
                failure = Some(error);
            }
        }
        Err(join) => {
            if failure.is_none() && !join.is_cancelled() {
                failure = Some(FilterError::Report.into());
            }
        }
    }

    if let Some(error) = failure {
        return Err(error);
    }

    if ctx.options.end_dot {
        if !last_was_newline {
            ctx.write_chunk(b"\n", false).await?;
        }
        // The terminating dot must reach the wire unescaped.
        let marker = ctx.marker.take();
        let terminated = ctx.write_chunk(b".\n", false).await;
        ctx.marker = marker;
        terminated?;
    }

    if ctx.chunking {
        // The filter's output size was unknowable up front, so earlier
        // flushes went out as intermediate chunks. Whatever is still
        // buffered becomes the final one.
        let residual = ctx.buffer.len() as u64;
        let flags = ChunkFlags {
            last: !ctx.options.more_data,
            reap: false,
        };
        ctx.announce_chunk(residual, flags).await?;
        ctx.disable_chunking();
    }

    ctx.flush().await
}

fn spawn_filter(config: &FilterConfig) -> io::Result<tokio::process::Child> {
    let Some((program, args)) = config.command.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "filter command is empty",
        ));
    };

    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

/// Start the background task that feeds the message to the filter.
///
/// The task writes with the caller's header and suppression settings
/// but with chunking, the terminating dot, line-start escaping, and
/// CRLF conversion all cleared, so the filter sees plain native lines.
fn spawn_writer(
    ctx: &TransportContext,
    stdin: tokio::process::ChildStdin,
    mut source: MessageSource,
    options: &TransportOptions,
) -> JoinHandle<WriterReport> {
    let mut writer_options = ctx.options;
    writer_options.chunked = false;
    writer_options.end_dot = false;
    writer_options.use_crlf = false;

    let mut writer_ctx = TransportContext::new(Destination::stream(stdin), writer_options)
        .with_recipients(ctx.chain.clone(), ctx.delivered.clone());
    if let Some(return_path) = &ctx.return_path {
        writer_ctx = writer_ctx.with_return_path(return_path.clone());
    }
    if let Some(limit) = ctx.size_limit {
        writer_ctx = writer_ctx.with_size_limit(limit);
    }
    if let Some(timeout) = ctx.timeout {
        writer_ctx = writer_ctx.with_timeout(timeout);
    }

    let transport_options = options.clone();

    tokio::spawn(async move {
        let start = Instant::now();
        let result = match write_direct(&mut writer_ctx, &mut source, &transport_options).await {
            // Close stdin so the filter sees end of input.
            Ok(()) => writer_ctx.target.shutdown().await,
            Err(error) => Err(error),
        };

        WriterReport {
            result,
            bytes: writer_ctx.bytes_written,
            timing: start.elapsed(),
        }
    })
}
