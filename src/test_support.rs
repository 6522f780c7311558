//! Fakes for the capture, executor and model seams.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::actions::Action;
use crate::capture::{CaptureError, CaptureSource, Frame};
use crate::executor::{ActionExecutor, ExecutionError};
use crate::model::{ModelError, ModelRequest, VisionModel};

const WIDTH: u32 = 90;
const HEIGHT: u32 = 80;

fn shade(x: u32, ascending: bool) -> u8 {
    let value = (x * 255 / (WIDTH - 1)) as u8;
    if ascending {
        value
    } else {
        255 - value
    }
}

/// Horizontal gradient, brightening left to right when `ascending`.
pub fn gradient_frame(ascending: bool) -> Frame {
    Frame::new(RgbaImage::from_fn(WIDTH, HEIGHT, |x, _| {
        let v = shade(x, ascending);
        Rgba([v, v, v, 255])
    }))
}

/// Top half rising, bottom half falling.
pub fn split_frame() -> Frame {
    Frame::new(RgbaImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let v = shade(x, y < HEIGHT / 2);
        Rgba([v, v, v, 255])
    }))
}

/// Returns the queued frames in order, then repeats the last one.
pub struct FrameSequence {
    frames: Mutex<VecDeque<Frame>>,
    captures: AtomicUsize,
}

impl FrameSequence {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for FrameSequence {
    async fn capture(&self) -> Result<Frame, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut frames = self.frames.lock().unwrap();
        match frames.len() {
            0 => Err(CaptureError::Unavailable("no frames queued".to_string())),
            1 => Ok(frames[0].clone()),
            _ => Ok(frames.pop_front().unwrap()),
        }
    }
}

pub struct FailingCapture;

#[async_trait]
impl CaptureSource for FailingCapture {
    async fn capture(&self) -> Result<Frame, CaptureError> {
        Err(CaptureError::Unavailable("window closed".to_string()))
    }
}

/// Records every action; optionally rejects actions with a given name.
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<Action>>,
    reject: Option<&'static str>,
}

impl RecordingExecutor {
    pub fn rejecting(name: &'static str) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            reject: Some(name),
        }
    }

    pub fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &Action) -> Result<(), ExecutionError> {
        if self.reject == Some(action.name()) {
            return Err(ExecutionError::Rejected(format!("{} refused", action.name())));
        }
        self.executed.lock().unwrap().push(action.clone());
        Ok(())
    }
}

pub enum Reply {
    Text(String),
    /// Never answers within the agent's model timeout.
    Hang(Duration),
    Unreachable,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// Plays back queued replies; answers `finished()` once they run out.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
    on_call: Option<CallHook>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Reply::text(r)).collect())
    }

    /// Run `hook` with the 1-based call number before each reply.
    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn guidance_seen(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.guidance.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn infer(&self, request: ModelRequest) -> Result<String, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        if let Some(hook) = &self.on_call {
            hook(call);
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Err(ModelError::Timeout)
            }
            Some(Reply::Unreachable) => Err(ModelError::MaxRetriesExceeded(
                4,
                "connection refused".to_string(),
            )),
            None => Ok("Action: finished(content='done')".to_string()),
        }
    }
}
