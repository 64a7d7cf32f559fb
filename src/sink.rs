// Handoff of completed uploads to whoever consumes them.
//
// Every transfer session runs on its own task and may complete at the same time as others, so a
// sink must accept deliveries from many tasks at once.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// The bytes of one completed write transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedImage {
    /// Last path component of the requested file.
    pub file_name: String,
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Receives completed uploads. Called once per successful transfer.
pub trait ImageSink: Send + Sync {
    fn deliver(&self, image: ReceivedImage);
}

/// Append-only queue of received images, shared between sessions and the consumer.
#[derive(Debug, Default)]
pub struct ImageQueue {
    images: Mutex<VecDeque<ReceivedImage>>,
}

impl ImageQueue {
    pub fn new() -> ImageQueue {
        ImageQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ReceivedImage>> {
        // Pushing never leaves the queue half-updated, so a poisoned lock is still usable.
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies of everything queued so far, oldest first.
    pub fn snapshot(&self) -> Vec<ReceivedImage> {
        self.lock().iter().cloned().collect()
    }

    /// Removes and returns everything queued so far, oldest first.
    pub fn take_all(&self) -> Vec<ReceivedImage> {
        self.lock().drain(..).collect()
    }
}

impl ImageSink for ImageQueue {
    fn deliver(&self, image: ReceivedImage) {
        self.lock().push_back(image);
    }
}

impl ImageSink for mpsc::UnboundedSender<ReceivedImage> {
    fn deliver(&self, image: ReceivedImage) {
        if let Err(e) = self.send(image) {
            log::warn!("Dropping {} received from {}: consumer is gone", e.0.file_name, e.0.peer);
        }
    }
}
