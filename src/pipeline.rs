//! The message write pipeline: headers, then body, then terminator.

use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    assembler::ChunkFlags,
    context::TransportContext,
    error::TransportError,
    headers::assemble_headers,
    message::MessageSource,
    options::TransportOptions,
    writer::Destination,
};

/// Read size for streaming the body out of the spool file.
const BODY_READ_SIZE: usize = 8 * 1024;

/// Write a spooled message to the context's destination.
///
/// Dispatches through the filter pipeline when a filter program is
/// configured; otherwise writes directly.
///
/// # Errors
/// Any header, body, chunk-framing, or filter failure, with the
/// originating error preserved.
pub async fn write_message(
    ctx: &mut TransportContext,
    mut source: MessageSource,
    options: &TransportOptions,
) -> Result<(), TransportError> {
    if options.filter.is_some() {
        crate::filter::write_filtered(ctx, source, options).await
    } else {
        write_direct(ctx, &mut source, options).await
    }
}

/// The direct (unfiltered) write path.
pub(crate) async fn write_direct(
    ctx: &mut TransportContext,
    source: &mut MessageSource,
    options: &TransportOptions,
) -> Result<(), TransportError> {
    ctx.reset();

    if !ctx.options.suppress_headers {
        let block = assemble_headers(ctx, source, options)?;
        // Stored headers are kept in native form on the spool.
        ctx.write_chunk(&block, false).await?;
    }

    if ctx.chunking {
        announce_frames(ctx, source).await?;
    }

    if !ctx.options.suppress_body {
        write_body(ctx, source).await?;
    }

    if ctx.options.end_dot {
        // The terminator is protocol framing, not message data: it is
        // never subject to start-of-line substitution.
        let marker = ctx.marker.take();
        let result = ctx.write_chunk(b".\n", false).await;
        ctx.marker = marker;
        result?;
    }

    ctx.flush().await
}

/// Announce the chunk-protocol frames for the whole message.
///
/// The prospective final chunk covers the buffered header bytes plus
/// the (size-limited) body, adjusted for line-ending expansion.  When
/// that exceeds one buffer, the headers go out first as a non-final
/// chunk with a reap of pipelined responses, surfacing early protocol
/// rejections before the body is committed.  Either way, framing is
/// disabled for the rest of the call once the final chunk is announced.
async fn announce_frames(
    ctx: &mut TransportContext,
    source: &MessageSource,
) -> Result<(), TransportError> {
    let header_size = ctx.buffer.len() as u64;
    let body_size = prospective_body_size(ctx, source);
    let last = ChunkFlags {
        last: !ctx.options.more_data,
        reap: false,
    };

    if header_size + body_size > ctx.buffer.capacity() as u64 {
        ctx.announce_chunk(
            header_size,
            ChunkFlags {
                last: false,
                reap: true,
            },
        )
        .await?;
        ctx.disable_chunking();
        ctx.flush_buffer().await?;
        ctx.announce_chunk(body_size, last).await?;
    } else {
        ctx.announce_chunk(header_size + body_size, last).await?;
        ctx.disable_chunking();
    }
    Ok(())
}

/// The body byte count the final chunk will carry: exact for the bytes
/// read from the spool, approximate (one extra byte per line) for
/// LF-to-CRLF expansion of native-format bodies.
fn prospective_body_size(ctx: &TransportContext, source: &MessageSource) -> u64 {
    if ctx.options.suppress_body || source.body.is_none() {
        return 0;
    }
    let mut size = source.body_size;
    if let Some(limit) = ctx.size_limit {
        size = size.min(limit);
    }
    if !source.wire_format && ctx.options.use_crlf {
        size += source.body_line_count;
    }
    size
}

/// Stream the body from the spool file.
///
/// A wire-format body needing no transformation and going to a
/// plaintext stream is bulk-copied past the assembler; everything else
/// goes through it in fixed-size reads.
async fn write_body(
    ctx: &mut TransportContext,
    source: &mut MessageSource,
) -> Result<(), TransportError> {
    let Some(file) = source.body.as_mut() else {
        return Ok(());
    };
    file.seek(SeekFrom::Start(source.body_offset)).await?;

    let fast_path = source.wire_format
        && ctx.options.use_crlf
        && ctx.marker.is_none()
        && !ctx.options.end_dot
        && ctx.target.is_stream()
        && !ctx.target.is_encrypted();

    if fast_path {
        ctx.flush_buffer().await?;
        let limit = ctx.size_limit.unwrap_or(u64::MAX);
        let mut reader = file.take(limit);
        if let Destination::Stream { io, .. } = &mut ctx.target {
            let copied = tokio::io::copy(&mut reader, io).await?;
            ctx.bytes_written += copied;
        }
        return Ok(());
    }

    let mut remaining = ctx.size_limit.unwrap_or(u64::MAX);
    let mut buf = vec![0_u8; BODY_READ_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        remaining -= read as u64;
        ctx.write_chunk(&buf[..read], source.wire_format).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        assembler::{ChunkSink, Escape},
        message::Header,
        options::WriteOptions,
        types::MessageId,
    };

    async fn spooled(body: &[u8], wire_format: bool) -> (tempfile::TempDir, MessageSource) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("msg.eml");
        std::fs::write(&path, body).expect("write spool file");
        let line_count = body.iter().filter(|&&b| b == b'\n').count() as u64;
        let source = MessageSource::open(
            MessageId::generate(),
            vec![Header::new("Subject: pipeline"), Header::new("To: a@example.com")],
            &path,
            0,
            line_count,
            wire_format,
        )
        .await
        .expect("open");
        (dir, source)
    }

    #[tokio::test]
    async fn headers_body_and_terminator_in_order() {
        let (_dir, source) = spooled(b"line one\nline two\n", false).await;
        let mut ctx = TransportContext::new(
            Destination::sink(),
            WriteOptions {
                end_dot: true,
                ..WriteOptions::default()
            },
        );
        ctx.marker = Some(Escape::smtp_dot());
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(
            ctx.target.into_sink().expect("sink"),
            b"Subject: pipeline\nTo: a@example.com\n\nline one\nline two\n.\n"
        );
    }

    #[tokio::test]
    async fn suppressed_headers_and_body() {
        let (_dir, source) = spooled(b"body\n", false).await;
        let mut ctx = TransportContext::new(
            Destination::sink(),
            WriteOptions {
                suppress_headers: true,
                ..WriteOptions::default()
            },
        );
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(ctx.target.into_sink().expect("sink"), b"body\n");

        let (_dir, source) = spooled(b"body\n", false).await;
        let mut ctx = TransportContext::new(
            Destination::sink(),
            WriteOptions {
                suppress_body: true,
                ..WriteOptions::default()
            },
        );
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(
            ctx.target.into_sink().expect("sink"),
            b"Subject: pipeline\nTo: a@example.com\n\n"
        );
    }

    #[tokio::test]
    async fn size_limit_is_exact_on_body_bytes() {
        let (_dir, source) = spooled(b"0123456789", false).await;
        let mut ctx =
            TransportContext::new(Destination::sink(), WriteOptions::default()).with_size_limit(4);
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(
            ctx.target.into_sink().expect("sink"),
            b"Subject: pipeline\nTo: a@example.com\n\n0123"
        );
    }

    #[tokio::test]
    async fn body_dot_lines_are_stuffed() {
        let (_dir, source) = spooled(b".hidden\nvisible\n", false).await;
        let mut ctx = TransportContext::new(Destination::sink(), WriteOptions::default());
        ctx.marker = Some(Escape::smtp_dot());
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(
            ctx.target.into_sink().expect("sink"),
            b"Subject: pipeline\nTo: a@example.com\n\n..hidden\nvisible\n"
        );
    }

    #[derive(Default)]
    struct FrameLog {
        calls: Arc<Mutex<Vec<(u64, ChunkFlags)>>>,
    }

    #[async_trait]
    impl ChunkSink for FrameLog {
        async fn chunk(
            &mut self,
            _target: &mut Destination,
            size: u64,
            flags: ChunkFlags,
        ) -> Result<(), TransportError> {
            self.calls.lock().expect("mutex").push((size, flags));
            Ok(())
        }
    }

    #[tokio::test]
    async fn small_message_is_announced_as_one_final_chunk() {
        let (_dir, source) = spooled(b"tiny body\r\n", true).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TransportContext::new(
            Destination::sink(),
            WriteOptions {
                chunked: true,
                use_crlf: true,
                ..WriteOptions::default()
            },
        )
        .with_chunker(Box::new(FrameLog {
            calls: Arc::clone(&calls),
        }));
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");

        let calls = calls.lock().expect("mutex");
        assert_eq!(calls.len(), 1);
        let (size, flags) = calls[0];
        assert!(flags.last);
        assert!(!flags.reap);
        assert_eq!(size, ctx.bytes_written);
    }

    #[tokio::test]
    async fn oversized_message_sends_headers_first_then_final_chunk() {
        let body = b"0123456789abcdef\r\n".repeat(16);
        let (_dir, source) = spooled(&body, true).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TransportContext::new(
            Destination::sink(),
            WriteOptions {
                chunked: true,
                use_crlf: true,
                ..WriteOptions::default()
            },
        )
        .with_buffer_capacity(128)
        .with_chunker(Box::new(FrameLog {
            calls: Arc::clone(&calls),
        }));
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");

        let calls = calls.lock().expect("mutex");
        assert_eq!(calls.len(), 2, "headers chunk then final body chunk");
        let (header_size, header_flags) = calls[0];
        let (body_size, body_flags) = calls[1];
        assert!(!header_flags.last);
        assert!(header_flags.reap);
        assert!(body_flags.last);
        assert_eq!(header_size + body_size, ctx.bytes_written);
    }

    #[tokio::test]
    async fn wire_format_body_collapses_without_crlf_option() {
        let (_dir, source) = spooled(b"one\r\ntwo\r\n", true).await;
        let mut ctx = TransportContext::new(Destination::sink(), WriteOptions::default());
        write_message(&mut ctx, source, &TransportOptions::default())
            .await
            .expect("write");
        assert_eq!(
            ctx.target.into_sink().expect("sink"),
            b"Subject: pipeline\nTo: a@example.com\n\none\ntwo\n"
        );
    }
}
