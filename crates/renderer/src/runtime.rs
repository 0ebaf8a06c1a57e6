use std::path::PathBuf;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Change requested from outside the render thread.
///
/// Requests are queued and applied between frames by
/// [`FrameOrchestrator::apply_requests`](crate::FrameOrchestrator::apply_requests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeRequest<K = String> {
    /// Resize the feedback surface.
    Resize { width: u32, height: u32 },
    /// Re-read a shader file and register it under `identity`.
    ReloadShader { identity: K, path: PathBuf },
    /// Unregister a shader identity.
    RemoveShader { identity: K },
    /// Load or replace a texture from an image file.
    AddTexture { identity: K, path: PathBuf },
    /// Drop a texture from the binding set.
    RemoveTexture { identity: K },
}

/// Cloneable handle used by watcher or UI threads to queue requests.
#[derive(Debug)]
pub struct RequestSender<K = String> {
    sender: Sender<RuntimeRequest<K>>,
}

impl<K> Clone for RequestSender<K> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K> RequestSender<K> {
    /// Queues a request; returns `false` once the render side has gone away.
    pub fn send(&self, request: RuntimeRequest<K>) -> bool {
        self.sender.send(request).is_ok()
    }

    pub fn resize(&self, width: u32, height: u32) -> bool {
        self.send(RuntimeRequest::Resize { width, height })
    }

    pub fn reload_shader(&self, identity: K, path: impl Into<PathBuf>) -> bool {
        self.send(RuntimeRequest::ReloadShader {
            identity,
            path: path.into(),
        })
    }
}

/// Receiving end owned by the render thread.
#[derive(Debug)]
pub struct RequestQueue<K = String> {
    receiver: Receiver<RuntimeRequest<K>>,
    sender: Sender<RuntimeRequest<K>>,
}

impl<K> Default for RequestQueue<K> {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { receiver, sender }
    }
}

impl<K> RequestQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> RequestSender<K> {
        RequestSender {
            sender: self.sender.clone(),
        }
    }

    /// Takes every pending request without blocking.
    ///
    /// Only the most recent resize survives; it keeps its position relative
    /// to the other requests.
    pub fn drain(&self) -> Vec<RuntimeRequest<K>> {
        let mut pending: Vec<RuntimeRequest<K>> = self.receiver.try_iter().collect();
        if let Some(last_resize) = pending
            .iter()
            .rposition(|request| matches!(request, RuntimeRequest::Resize { .. }))
        {
            let mut index = 0;
            pending.retain(|request| {
                let keep = index == last_resize || !matches!(request, RuntimeRequest::Resize { .. });
                index += 1;
                keep
            });
        }
        pending
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Time state handed to shaders as `iTime` / `iFrame`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    /// Elapsed wall-clock or simulated time in seconds.
    pub seconds: f32,
    /// Monotonic frame counter for the running session.
    pub frame_index: u64,
}

impl TimeSample {
    pub fn new(seconds: f32, frame_index: u64) -> Self {
        Self {
            seconds,
            frame_index,
        }
    }
}

/// Abstraction over where time values originate from.
pub trait TimeSource: Send {
    /// Produces a time sample for the next frame.
    fn sample(&mut self) -> TimeSample;
}

/// Time source backed by the system monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: Instant,
    frame: u64,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            frame: 0,
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn sample(&mut self) -> TimeSample {
        let sample = TimeSample::new(self.origin.elapsed().as_secs_f32(), self.frame);
        self.frame = self.frame.saturating_add(1);
        sample
    }
}

/// Deterministic source advancing by `1 / frame_rate` seconds per frame.
///
/// Used for offline renders so exported frames do not depend on how fast
/// the GPU happens to be.
#[derive(Debug, Clone, Copy)]
pub struct SteppedTimeSource {
    start: f32,
    frame_rate: f32,
    frame: u64,
}

impl SteppedTimeSource {
    pub fn new(start: f32, frame_rate: f32) -> Self {
        Self {
            start,
            frame_rate: frame_rate.max(f32::EPSILON),
            frame: 0,
        }
    }
}

impl TimeSource for SteppedTimeSource {
    fn sample(&mut self) -> TimeSample {
        let seconds = self.start + self.frame as f32 / self.frame_rate;
        let sample = TimeSample::new(seconds, self.frame);
        self.frame = self.frame.saturating_add(1);
        sample
    }
}

/// Convenient alias for owning time sources behind trait objects.
pub type BoxedTimeSource = Box<dyn TimeSource + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resizes_coalesce_to_latest() {
        let queue: RequestQueue = RequestQueue::new();
        let sender = queue.sender();
        sender.resize(100, 100);
        sender.reload_shader("a.frag".to_string(), "a.frag");
        sender.resize(200, 150);
        sender.resize(800, 600);
        sender.send(RuntimeRequest::RemoveTexture {
            identity: "t".to_string(),
        });

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                RuntimeRequest::ReloadShader {
                    identity: "a.frag".to_string(),
                    path: PathBuf::from("a.frag"),
                },
                RuntimeRequest::Resize {
                    width: 800,
                    height: 600,
                },
                RuntimeRequest::RemoveTexture {
                    identity: "t".to_string(),
                },
            ]
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn senders_work_across_threads() {
        let queue: RequestQueue = RequestQueue::new();
        let sender = queue.sender();
        let handle = std::thread::spawn(move || {
            for size in 1..=3 {
                sender.resize(size, size);
            }
        });
        handle.join().unwrap();
        assert_eq!(
            queue.drain(),
            vec![RuntimeRequest::Resize {
                width: 3,
                height: 3,
            }]
        );
    }

    #[test]
    fn stepped_time_advances_per_frame() {
        let mut source = SteppedTimeSource::new(1.0, 4.0);
        assert_eq!(source.sample(), TimeSample::new(1.0, 0));
        assert_eq!(source.sample(), TimeSample::new(1.25, 1));
        assert_eq!(source.sample(), TimeSample::new(1.5, 2));
    }

    #[test]
    fn system_time_counts_frames() {
        let mut source = SystemTimeSource::new();
        assert_eq!(source.sample().frame_index, 0);
        let later = source.sample();
        assert_eq!(later.frame_index, 1);
        assert!(later.seconds >= 0.0);
    }
}
