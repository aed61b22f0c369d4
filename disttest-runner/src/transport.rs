// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Newline-delimited framing over ordered byte streams.
//!
//! Connection setup is left to the caller: anything implementing tokio's
//! [`AsyncBufRead`] or [`AsyncWrite`] works, whether that is a child
//! process's pipes, a socket, or an in-memory duplex stream.

use crate::errors::TransportError;
use debug_ignore::DebugIgnore;
use disttest_wire::{
    ControllerMessage, DecodeError, WorkerMessage, decode_controller_message,
    decode_worker_message, encode_controller_message, encode_worker_message,
};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Reads newline-delimited frames.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: DebugIgnore<R>,
    buf: Vec<u8>,
    frames_read: u64,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Creates a new `FrameReader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader: DebugIgnore(reader),
            buf: Vec::new(),
            frames_read: 0,
        }
    }

    /// Reads the next frame, without its line terminator.
    ///
    /// Returns `Ok(None)` once the stream has ended. Blank lines are skipped.
    /// A frame that isn't valid UTF-8 is returned as a [`DecodeError`]: the
    /// bad line has been consumed, so the stream is still usable.
    ///
    /// This operation is cancel-safe: partially-read frames are kept in an
    /// internal buffer and completed by the next call.
    pub async fn next_frame(
        &mut self,
    ) -> Result<Option<Result<String, DecodeError>>, TransportError> {
        loop {
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|error| TransportError::Read(Arc::new(error)))?;
            if n == 0 && self.buf.is_empty() {
                return Ok(None);
            }

            let mut bytes = std::mem::take(&mut self.buf);
            while let Some(b'\n' | b'\r') = bytes.last() {
                bytes.pop();
            }
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            self.frames_read += 1;
            return Ok(Some(String::from_utf8(bytes).map_err(DecodeError::InvalidUtf8)));
        }
    }

    /// Reads and decodes the next message sent by a worker.
    ///
    /// The outer result is a transport failure, the inner one a frame that
    /// couldn't be decoded. The stream is still usable after a decode error.
    pub async fn next_worker_message(
        &mut self,
    ) -> Result<Option<Result<WorkerMessage, DecodeError>>, TransportError> {
        let frame = self.next_frame().await?;
        Ok(frame.map(|frame| frame.and_then(|frame| decode_worker_message(&frame))))
    }

    /// Reads and decodes the next message sent by the controller.
    ///
    /// Error handling is the same as for [`Self::next_worker_message`].
    pub async fn next_controller_message(
        &mut self,
    ) -> Result<Option<Result<ControllerMessage, DecodeError>>, TransportError> {
        let frame = self.next_frame().await?;
        Ok(frame.map(|frame| frame.and_then(|frame| decode_controller_message(&frame))))
    }

    /// Returns the number of frames read so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Writes newline-delimited frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: DebugIgnore<W>,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a new `FrameWriter`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: DebugIgnore(writer),
            frames_written: 0,
        }
    }

    /// Writes a single frame followed by a newline, and flushes.
    ///
    /// `frame` must not contain a newline.
    pub async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.write_frame_bytes(frame.as_bytes()).await
    }

    /// Writes a single frame of arbitrary bytes followed by a newline, and
    /// flushes.
    ///
    /// `frame` must not contain a newline.
    pub async fn write_frame_bytes(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        debug_assert!(!frame.contains(&b'\n'), "frames are single lines");
        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame);
        line.push(b'\n');

        let map_err = |error| TransportError::Write(Arc::new(error));
        self.writer.write_all(&line).await.map_err(map_err)?;
        self.writer.flush().await.map_err(map_err)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Encodes and writes a message to the controller.
    pub async fn send_worker_message(
        &mut self,
        message: &WorkerMessage,
    ) -> Result<(), TransportError> {
        let frame = encode_worker_message(message)?;
        self.write_frame(&frame).await
    }

    /// Encodes and writes a message to a worker.
    pub async fn send_controller_message(
        &mut self,
        message: &ControllerMessage,
    ) -> Result<(), TransportError> {
        let frame = encode_controller_message(message)?;
        self.write_frame(&frame).await
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer
            .shutdown()
            .await
            .map_err(|error| TransportError::Write(Arc::new(error)))
    }

    /// Returns the number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}
