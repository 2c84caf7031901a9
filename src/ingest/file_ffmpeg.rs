//! FFmpeg clip decoder for `LoopingFileSource`.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::ClipDecoder;
use crate::frame::{now_epoch_s, Frame};

struct DecoderState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_rate: Option<f64>,
    draining: bool,
}

pub(crate) struct FfmpegClip {
    path: String,
    state: Option<DecoderState>,
}

impl FfmpegClip {
    pub(crate) fn new(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self {
            path: path.to_string(),
            state: None,
        })
    }

    fn open_state(&self) -> Result<DecoderState> {
        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", self.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let frame_rate = if rate.numerator() > 0 && rate.denominator() > 0 {
            Some(f64::from(rate))
        } else {
            None
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(DecoderState {
            input,
            stream_index,
            decoder,
            scaler,
            frame_rate,
            draining: false,
        })
    }
}

impl ClipDecoder for FfmpegClip {
    fn open(&mut self) -> Result<()> {
        self.state = Some(self.open_state()?);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let state = self.state.as_mut().context("ffmpeg clip not open")?;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return Frame::new(pixels, width, height, now_epoch_s()).map(Some);
            }
            if state.draining {
                return Ok(None);
            }

            let mut sent = false;
            for (stream, packet) in state.input.packets() {
                if stream.index() != state.stream_index {
                    continue;
                }
                state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                state.decoder.send_eof().context("flush ffmpeg decoder")?;
                state.draining = true;
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        let state = self.state.as_mut().context("ffmpeg clip not open")?;
        state
            .input
            .seek(0, ..)
            .with_context(|| format!("seek {} to start", self.path))?;
        state.decoder.flush();
        state.draining = false;
        Ok(())
    }

    fn frame_rate(&self) -> Option<f64> {
        self.state.as_ref().and_then(|state| state.frame_rate)
    }

    fn close(&mut self) {
        self.state = None;
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
