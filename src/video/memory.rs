//! In-process media backend.
//!
//! Serves a fixed clip for every path it is asked to open and records what
//! sinks receive. Read and write faults can be injected, and the number of
//! source handles still open is observable. Used by tests and by dry runs on
//! machines without FFmpeg.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};

use super::{MediaBackend, VideoInfo, VideoSink, VideoSource};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct MemorySource {
    info: VideoInfo,
    frames: VecDeque<Frame>,
    position: u64,
    fail_at: Option<u64>,
}

impl MemorySource {
    pub fn new(fps: f64, frames: Vec<Frame>) -> Self {
        let (width, height) = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0));
        Self {
            info: VideoInfo {
                fps,
                width,
                height,
                total_frames: frames.len() as u64,
            },
            frames: frames.into(),
            position: 0,
            fail_at: None,
        }
    }

    /// Override the frame count the source claims to hold.
    pub fn with_reported_total(mut self, total_frames: u64) -> Self {
        self.info.total_frames = total_frames;
        self
    }

    /// Fail the read of frame `index` instead of returning it.
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl VideoSource for MemorySource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.fail_at == Some(self.position) {
            return Err(anyhow!("corrupt packet at frame {}", self.position));
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    frames: Vec<Frame>,
    finished: bool,
}

type Outputs = Arc<Mutex<HashMap<PathBuf, Recorded>>>;

fn lock(outputs: &Outputs) -> MutexGuard<'_, HashMap<PathBuf, Recorded>> {
    outputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend that replays one clip and captures sink output per path.
pub struct MemoryMedia {
    clip: MemorySource,
    outputs: Outputs,
    persist: bool,
    sink_fault: Option<SinkFault>,
    open_sources: Arc<AtomicUsize>,
}

#[derive(Clone, Copy, Debug)]
enum SinkFault {
    Create,
    WriteAt(u64),
}

impl MemoryMedia {
    pub fn new(clip: MemorySource) -> Self {
        Self {
            clip,
            outputs: Arc::default(),
            persist: false,
            sink_fault: None,
            open_sources: Arc::default(),
        }
    }

    /// Refuse to create any output stream.
    pub fn failing_sink(mut self) -> Self {
        self.sink_fault = Some(SinkFault::Create);
        self
    }

    /// Fail the write of output frame `index`.
    pub fn sink_failing_at(mut self, index: u64) -> Self {
        self.sink_fault = Some(SinkFault::WriteAt(index));
        self
    }

    /// Source handles handed out and not yet dropped.
    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }

    /// Also dump finished outputs to disk as raw RGB24 frames, back to back.
    pub fn with_disk_output(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Frames written to the sink created for `path` so far.
    pub fn written(&self, path: &Path) -> Vec<Frame> {
        lock(&self.outputs)
            .get(path)
            .map(|r| r.frames.clone())
            .unwrap_or_default()
    }

    /// Whether the sink for `path` was finished cleanly.
    pub fn finished(&self, path: &Path) -> bool {
        lock(&self.outputs)
            .get(path)
            .map(|r| r.finished)
            .unwrap_or(false)
    }
}

impl MediaBackend for MemoryMedia {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_source(&self, _path: &Path) -> Result<Box<dyn VideoSource>> {
        self.open_sources.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OpenedSource {
            source: self.clip.clone(),
            open: Arc::clone(&self.open_sources),
        }))
    }

    fn create_sink(&self, path: &Path, info: &VideoInfo) -> Result<Box<dyn VideoSink>> {
        if let Some(SinkFault::Create) = self.sink_fault {
            return Err(anyhow!("output device is read-only"));
        }
        lock(&self.outputs).insert(path.to_path_buf(), Recorded::default());
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            width: info.width,
            height: info.height,
            outputs: Arc::clone(&self.outputs),
            persist: self.persist,
            fail_at: match self.sink_fault {
                Some(SinkFault::WriteAt(index)) => Some(index),
                _ => None,
            },
            written: 0,
        }))
    }
}

struct OpenedSource {
    source: MemorySource,
    open: Arc<AtomicUsize>,
}

impl VideoSource for OpenedSource {
    fn info(&self) -> VideoInfo {
        self.source.info()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.source.next_frame()
    }
}

impl Drop for OpenedSource {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySink {
    path: PathBuf,
    width: u32,
    height: u32,
    outputs: Outputs,
    persist: bool,
    fail_at: Option<u64>,
    written: u64,
}

impl VideoSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.fail_at == Some(self.written) {
            return Err(anyhow!("disk full after {} frames", self.written));
        }
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{}, stream is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }
        lock(&self.outputs)
            .entry(self.path.clone())
            .or_default()
            .frames
            .push(frame.clone());
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut outputs = lock(&self.outputs);
        let recorded = outputs.entry(self.path.clone()).or_default();
        recorded.finished = true;
        if self.persist {
            let bytes: Vec<u8> = recorded
                .frames
                .iter()
                .flat_map(|f| f.pixels().iter().copied())
                .collect();
            std::fs::write(&self.path, bytes)
                .with_context(|| format!("write {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_rejects_mismatched_frames() {
        let media = MemoryMedia::new(MemorySource::new(
            10.0,
            vec![Frame::filled(4, 4, [0, 0, 0]).unwrap()],
        ));
        let info = media.clip.info();
        let mut sink = media.create_sink(Path::new("x.mp4"), &info).unwrap();
        let wrong = Frame::filled(5, 4, [0, 0, 0]).unwrap();
        assert!(sink.write_frame(&wrong).is_err());
    }

    #[test]
    fn disk_output_is_raw_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let frames = vec![Frame::filled(2, 2, [1, 2, 3]).unwrap(); 2];
        let media = MemoryMedia::new(MemorySource::new(10.0, frames)).with_disk_output();
        let mut source = media.open_source(Path::new("ignored")).unwrap();
        let mut sink = media.create_sink(&out, &source.info()).unwrap();
        while let Some(frame) = source.next_frame().unwrap() {
            sink.write_frame(&frame).unwrap();
        }
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&out).unwrap().len(), 2 * 2 * 2 * 3);
        assert!(media.finished(&out));
        drop(source);
        assert_eq!(media.open_sources(), 0);
    }

    #[test]
    fn injected_sink_faults() {
        let frame = Frame::filled(2, 2, [0, 0, 0]).unwrap();
        let clip = MemorySource::new(10.0, vec![frame.clone(); 3]);
        let info = clip.info();

        let refusing = MemoryMedia::new(clip.clone()).failing_sink();
        assert!(refusing.create_sink(Path::new("a.mp4"), &info).is_err());

        let media = MemoryMedia::new(clip).sink_failing_at(1);
        let mut sink = media.create_sink(Path::new("b.mp4"), &info).unwrap();
        sink.write_frame(&frame).unwrap();
        assert!(sink.write_frame(&frame).is_err());
        assert_eq!(media.written(Path::new("b.mp4")).len(), 1);
    }
}
