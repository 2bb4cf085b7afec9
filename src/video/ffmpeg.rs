//! FFmpeg container support.
//!
//! Sources decode any container FFmpeg reads and convert to RGB24. Sinks
//! always write MP4 with MPEG-4 Part 2 video, whatever the input codec was.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::Rational;

use super::{MediaBackend, VideoInfo, VideoSink, VideoSource};
use crate::frame::{Frame, CHANNELS};

/// Rate assumed when the container does not report one.
const FALLBACK_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegMedia;

impl MediaBackend for FfmpegMedia {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_source(&self, path: &Path) -> Result<Box<dyn VideoSource>> {
        Ok(Box::new(FfmpegSource::open(path)?))
    }

    fn create_sink(&self, path: &Path, info: &VideoInfo) -> Result<Box<dyn VideoSink>> {
        Ok(Box::new(FfmpegSink::create(path, info)?))
    }
}

struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: scaling::Context,
    info: VideoInfo,
    eof_sent: bool,
}

impl FfmpegSource {
    fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;

        let (stream_index, parameters, fps, frames) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("file has no video track"))?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
                f64::from(rate)
            } else {
                FALLBACK_FPS
            };
            (stream.index(), stream.parameters(), fps, stream.frames())
        };

        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let total_frames = if frames > 0 {
            frames as u64
        } else if input.duration() > 0 {
            // Container duration is in AV_TIME_BASE (microsecond) units.
            (input.duration() as f64 / 1_000_000.0 * fps).round() as u64
        } else {
            0
        };

        let scaler = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
        };

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            info,
            eof_sent: false,
        })
    }

    fn to_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .context("scale frame to RGB")?;
        let (width, height) = (rgb.width(), rgb.height());
        let row_bytes = width as usize * CHANNELS;
        let stride = rgb.stride(0);
        let data = rgb.data(0);

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        Ok(Frame::from_rgb(width, height, pixels)?)
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.to_frame(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut fed = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                fed = true;
                break;
            }
            if !fed {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }
        }
    }
}

struct FfmpegSink {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

impl FfmpegSink {
    fn create(path: &Path, info: &VideoInfo) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        if info.width == 0 || info.height == 0 {
            return Err(anyhow!("cannot encode {}x{} video", info.width, info.height));
        }
        let mut output = ffmpeg::format::output_as(&path, "mp4")
            .with_context(|| format!("failed to create '{}'", path.display()))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg build has no MPEG-4 encoder"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let fps = if info.fps.is_finite() && info.fps > 0.0 {
            info.fps
        } else {
            FALLBACK_FPS
        };
        let frame_rate = Rational::from(fps);
        let encoder_time_base = frame_rate.invert();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("allocate MPEG-4 encoder")?;
        encoder.set_width(info.width);
        encoder.set_height(info.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        encoder.set_frame_rate(Some(frame_rate));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).context("open MPEG-4 encoder")?;

        let stream_index = {
            let mut stream = output.add_stream(codec).context("add output stream")?;
            stream.set_time_base(encoder_time_base);
            stream.set_parameters(&encoder);
            stream.index()
        };
        output.write_header().context("write mp4 header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("output stream vanished after header"))?;

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            info.width,
            info.height,
            Pixel::YUV420P,
            info.width,
            info.height,
            scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width: info.width,
            height: info.height,
            next_pts: 0,
        })
    }

    fn write_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write mp4 packet")?;
        }
        Ok(())
    }
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{}, stream is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }

        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, self.width, self.height);
        let row_bytes = self.width as usize * CHANNELS;
        let stride = rgb.stride(0);
        let data = rgb.data_mut(0);
        for (row, src) in frame.pixels().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            data.get_mut(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?
                .copy_from_slice(src);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .context("convert frame to YUV420P")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .context("send frame to encoder")?;
        self.write_packets()
    }

    fn finish(&mut self) -> Result<()> {
        self.encoder.send_eof().context("flush encoder")?;
        self.write_packets()?;
        self.output.write_trailer().context("write mp4 trailer")?;
        Ok(())
    }
}
