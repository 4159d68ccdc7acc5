// src/workers/processor.rs
//
// Worker thread body. Each worker owns one `FrameExtractor`; nothing is
// shared with the pool except the request and output channels.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{WorkerCommand, WorkerReply, WorkerRequest, WorkerResponse};
use crate::framing::{extract_frames, FrameDetectionConfig, FrameExtractor, RawFrame};
use crate::io::now_ms;

/// What a worker thread sends back to its router
#[derive(Debug)]
pub(super) enum WorkerOutput {
    Response(WorkerResponse),
    /// The worker panicked; the thread exits after sending this
    Fault(String),
}

/// Frame extraction state owned by one worker thread.
pub(super) struct FrameProcessor {
    extractor: FrameExtractor,
}

impl FrameProcessor {
    pub fn new() -> Self {
        FrameProcessor {
            extractor: FrameExtractor::new(FrameDetectionConfig::default()),
        }
    }

    pub fn handle(&mut self, command: WorkerCommand) -> WorkerReply {
        match command {
            WorkerCommand::Configure(config) => {
                self.extractor.configure(config);
                self.extractor.clear_buffer();
                WorkerReply::Configured
            }
            WorkerCommand::ProcessData(data) => {
                let errors_before = self.extractor.checksum_errors();
                let frames = self.extractor.push(&data);
                WorkerReply::FrameProcessed {
                    frames,
                    checksum_errors: self.extractor.checksum_errors() - errors_before,
                }
            }
            WorkerCommand::ExtractChunk(data) => {
                let extraction = extract_frames(&data, self.extractor.config());
                let timestamp = now_ms();
                WorkerReply::ChunkExtracted {
                    frames: extraction
                        .frames
                        .into_iter()
                        .map(|data| RawFrame {
                            data,
                            timestamp,
                            sequence: 0,
                            checksum_valid: true,
                        })
                        .collect(),
                    consumed: extraction.consumed,
                    checksum_errors: extraction.checksum_errors,
                }
            }
            WorkerCommand::Reset => {
                self.extractor.reset();
                WorkerReply::Reset
            }
            WorkerCommand::GetStats => WorkerReply::Stats(self.extractor.stats()),
            #[cfg(test)]
            WorkerCommand::Stall(duration) => {
                std::thread::sleep(duration);
                WorkerReply::Reset
            }
            #[cfg(test)]
            WorkerCommand::Panic => panic!("scripted worker panic"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Start a worker thread. It runs until the request channel closes or a
/// command panics.
pub(super) fn spawn(
    worker: usize,
    requests: std_mpsc::Receiver<WorkerRequest>,
    output: mpsc::UnboundedSender<WorkerOutput>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("wirestream-worker-{}", worker))
        .spawn(move || {
            let mut processor = FrameProcessor::new();
            debug!("[workers] Worker {} started", worker);

            for request in requests {
                let WorkerRequest { id, command } = request;
                match catch_unwind(AssertUnwindSafe(|| processor.handle(command))) {
                    Ok(reply) => {
                        if output
                            .send(WorkerOutput::Response(WorkerResponse { id, reply }))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("[workers] Worker {} panicked on {}: {}", worker, id, message);
                        let _ = output.send(WorkerOutput::Fault(message));
                        return;
                    }
                }
            }

            debug!("[workers] Worker {} stopped", worker);
        })
}
