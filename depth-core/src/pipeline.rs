//! The streaming pipeline: four cooperative tasks wired to a pair of
//! channels rather than a live socket, so the whole thing is exercisable
//! without a WebSocket (spec §4.7). `depth-server` supplies the real axum
//! `WebSocket` halves; tests supply an in-process channel pair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::DepthFrame;
use crate::codec::pack_depth_payload;
use crate::config::Settings;
use crate::error::DepthError;
use crate::inference::{target_size_for, InferenceEngine};
use crate::queue::DroppingQueue;
use crate::session::{Session, SessionManager};
use crate::stats::StatisticsCollector;

const REQUEST_QUEUE_CAPACITY: usize = 32;
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const LATENCY_CLAMP_MS: (f64, f64) = (0.0, 10_000.0);

#[derive(Debug, Clone, Deserialize)]
struct IncomingRequest {
    time_ms: Option<f64>,
    rtt: Option<f64>,
}

#[derive(Debug, Clone)]
struct Request {
    time_ms: f64,
    recv_time: Instant,
    rtt_ms: Option<f64>,
}

/// What a completed pipeline task hands to the sender: the packed payload
/// plus the per-stage timings needed for the optional profiling log.
struct PipelineOutput {
    payload: Vec<u8>,
    decode_s: f64,
    infer_s: f64,
    pack_s: f64,
    queue_wait_s: f64,
    total_s: f64,
}

/// Handle to a running pipeline. Dropping it does not stop the pipeline;
/// call `stop` explicitly (e.g. when the transport layer detects the
/// socket closed) or let the receiver/sender tasks notice EOF on their own.
pub struct PipelineHandle {
    pub stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawns the receiver, processor, sender and stats-reporter tasks for one
/// session connection. `manager` lets the processor re-verify the session
/// still exists on every dequeue (spec §4.7/§7): a session deleted
/// mid-stream must stop the pipeline, not just leave it running against a
/// stale `Arc<Session>`.
pub fn spawn(
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    engine: Arc<InferenceEngine>,
    settings: Arc<Settings>,
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<Vec<u8>>,
) -> PipelineHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let request_queue = Arc::new(DroppingQueue::new(REQUEST_QUEUE_CAPACITY));
    let (send_tx, send_rx) = mpsc::unbounded_channel::<JoinHandle<Option<PipelineOutput>>>();
    let stats = Arc::new(StatisticsCollector::new());
    let admission = Arc::new(Semaphore::new(settings.max_concurrent_tasks.max(1)));
    let session_id = session.session_id.clone();

    let receiver = tokio::spawn(receiver_task(
        incoming,
        request_queue.clone(),
        stop_tx.clone(),
        stop_rx.clone(),
    ));
    let processor = tokio::spawn(processor_task(
        manager,
        session_id,
        engine,
        settings.clone(),
        request_queue,
        send_tx,
        stats.clone(),
        admission,
        stop_tx.clone(),
        stop_rx.clone(),
    ));
    let sender = tokio::spawn(sender_task(
        send_rx,
        outgoing,
        stats.clone(),
        settings,
        session.clone(),
        stop_tx.clone(),
        stop_rx.clone(),
    ));
    let reporter = tokio::spawn(reporter_task(stats, session.session_id.clone(), stop_rx));

    let stop_tx_for_join = stop_tx.clone();
    let join = tokio::spawn(async move {
        let _ = receiver.await;
        let _ = processor.await;
        let _ = sender.await;
        let _ = stop_tx_for_join.send(true);
        let _ = reporter.await;
    });

    PipelineHandle { stop: stop_tx, join }
}

async fn receiver_task(
    mut incoming: mpsc::Receiver<String>,
    queue: Arc<DroppingQueue<Request>>,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let raw = tokio::select! {
            _ = stop_rx.changed() => return,
            msg = incoming.recv() => match msg {
                Some(raw) => raw,
                None => {
                    let _ = stop_tx.send(true);
                    return;
                }
            },
        };

        let recv_time = Instant::now();
        match serde_json::from_str::<IncomingRequest>(&raw) {
            Ok(parsed) => {
                if let Some(time_ms) = parsed.time_ms {
                    queue.put(Request {
                        time_ms,
                        recv_time,
                        rtt_ms: parsed.rtt,
                    });
                }
            }
            Err(err) => warn!(%err, "ignoring malformed request frame"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn processor_task(
    manager: Arc<SessionManager>,
    session_id: String,
    engine: Arc<InferenceEngine>,
    settings: Arc<Settings>,
    queue: Arc<DroppingQueue<Request>>,
    send_tx: mpsc::UnboundedSender<JoinHandle<Option<PipelineOutput>>>,
    stats: Arc<StatisticsCollector>,
    admission: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        stats.set("request_queue_size", queue.len() as i64);
        stats.set(
            "active_tasks",
            (settings.max_concurrent_tasks.max(1) - admission.available_permits()) as i64,
        );

        let request = tokio::select! {
            _ = stop_rx.changed() => return,
            req = queue.get() => req,
        };

        // Re-resolve the session on every dequeue (spec §4.7/§7): if it was
        // deleted mid-stream the pipeline must stop rather than keep running
        // against a stale handle.
        let session = match manager.get(&session_id).await {
            Some(session) => session,
            None => {
                error!(session_id = %session_id, "session vanished mid-stream; stopping pipeline");
                let _ = stop_tx.send(true);
                return;
            }
        };

        let dropped = queue.reset_dropped_count();
        if dropped > 0 {
            stats.increment("dropped_count", dropped as i64);
            session.update_telemetry(&[("dropped", dropped as f64)]).await;
        }

        if let Some(rtt) = request.rtt_ms {
            let clamped = rtt.clamp(LATENCY_CLAMP_MS.0, LATENCY_CLAMP_MS.1);
            session.update_telemetry(&[("latency_ms", clamped)]).await;
        }

        let permit = match admission.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let engine = engine.clone();
        let settings = settings.clone();
        let stats = stats.clone();
        let handle = tokio::spawn(async move {
            let result = process_request(&session, &engine, &settings, &stats, request).await;
            drop(permit);
            result
        });

        if send_tx.send(handle).is_err() {
            return;
        }
    }
}

async fn process_request(
    session: &Arc<Session>,
    engine: &Arc<InferenceEngine>,
    settings: &Settings,
    stats: &StatisticsCollector,
    request: Request,
) -> Option<PipelineOutput> {
    let queue_wait_s = request.recv_time.elapsed().as_secs_f64();
    stats.add("queue_wait_s", queue_wait_s);
    let total_start = Instant::now();
    let compress = settings.depth_compression_level > 0;

    if let Some(cached) = session.get_cached_depth(request.time_ms, true).await {
        let pack_start = Instant::now();
        let payload = pack_depth_payload(
            &cached.depth,
            cached.timestamp_ms,
            cached.z_min,
            cached.z_max,
            compress,
        );
        let pack_s = pack_start.elapsed().as_secs_f64();
        stats.add("pack_s", pack_s);
        let total_s = total_start.elapsed().as_secs_f64();
        stats.add("total_s", total_s);

        session
            .update_telemetry(&[("queue_wait_s", queue_wait_s), ("pack_s", pack_s), ("total_s", total_s)])
            .await;

        return Some(PipelineOutput {
            payload: payload.buffer,
            decode_s: 0.0,
            infer_s: 0.0,
            pack_s,
            queue_wait_s,
            total_s,
        });
    }

    let decode_start = Instant::now();
    let time_ms = request.time_ms;
    let decoder_session = session.clone();
    let decode_result =
        tokio::task::spawn_blocking(move || decoder_session.decoder.decode_at(time_ms)).await;
    let decode_s = decode_start.elapsed().as_secs_f64();

    let (frame, frame_info) = match decode_result {
        Ok(Ok(pair)) => pair,
        Ok(Err(DepthError::EndOfStream)) => return None,
        Ok(Err(err)) => {
            error!(%err, "decode error");
            return None;
        }
        Err(join_err) => {
            error!(%join_err, "decode task panicked");
            return None;
        }
    };
    stats.add("decode_s", decode_s);

    let infer_start = Instant::now();
    let process_res = session.current_process_res().await;
    let (frame_h, frame_w, _) = frame.dim();
    let target_size = target_size_for(frame_w as u32, frame_h as u32, settings.depth_downsample_factor);
    let prediction = match engine.infer(&frame, process_res, Some(target_size)).await {
        Ok(prediction) => prediction,
        Err(err) => {
            error!(%err, "inference error");
            return None;
        }
    };
    let infer_s = infer_start.elapsed().as_secs_f64();
    stats.add("infer_s", infer_s);

    let frame_time_ms = if frame_info.time_ms >= 0.0 { frame_info.time_ms } else { time_ms };
    let depth_frame = DepthFrame {
        timestamp_ms: frame_time_ms,
        depth: prediction.depth,
        z_min: prediction.z_min,
        z_max: prediction.z_max,
    };
    session.store_depth_frame(depth_frame.clone()).await;

    let pack_start = Instant::now();
    let payload = pack_depth_payload(
        &depth_frame.depth,
        depth_frame.timestamp_ms,
        depth_frame.z_min,
        depth_frame.z_max,
        compress,
    );
    let pack_s = pack_start.elapsed().as_secs_f64();
    stats.add("pack_s", pack_s);

    let total_s = total_start.elapsed().as_secs_f64();
    stats.add("total_s", total_s);

    session
        .update_telemetry(&[
            ("queue_wait_s", queue_wait_s),
            ("decode_s", decode_s),
            ("infer_s", infer_s),
            ("pack_s", pack_s),
            ("total_s", total_s),
        ])
        .await;

    Some(PipelineOutput {
        payload: payload.buffer,
        decode_s,
        infer_s,
        pack_s,
        queue_wait_s,
        total_s,
    })
}

#[allow(clippy::too_many_arguments)]
async fn sender_task(
    mut send_rx: mpsc::UnboundedReceiver<JoinHandle<Option<PipelineOutput>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    stats: Arc<StatisticsCollector>,
    settings: Arc<Settings>,
    session: Arc<Session>,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let handle = tokio::select! {
            _ = stop_rx.changed() => return,
            next = send_rx.recv() => match next {
                Some(handle) => handle,
                None => return,
            },
        };

        // Awaiting each handle in arrival order serializes network writes
        // by request order, not completion order, even though the tasks
        // themselves may finish out of order.
        let output = match handle.await {
            Ok(Some(output)) => output,
            Ok(None) => continue,
            Err(join_err) => {
                error!(%join_err, "pipeline task panicked");
                continue;
            }
        };

        let send_start = Instant::now();
        if outgoing.send(output.payload).await.is_err() {
            let _ = stop_tx.send(true);
            return;
        }
        let ws_send_s = send_start.elapsed().as_secs_f64();
        stats.add("ws_send_s", ws_send_s);
        session.update_telemetry(&[("ws_send_s", ws_send_s)]).await;

        if settings.profile_timing {
            info!(
                session_id = %session.session_id,
                decode_s = output.decode_s,
                infer_s = output.infer_s,
                pack_s = output.pack_s,
                ws_send_s,
                queue_wait_s = output.queue_wait_s,
                total_s = output.total_s,
                "depth_timing",
            );
        }
    }
}

async fn reporter_task(stats: Arc<StatisticsCollector>, session_id: String, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = interval.tick() => {
                let snapshot = stats.snapshot_and_reset();
                if snapshot.series.is_empty() && snapshot.gauges.is_empty() {
                    continue;
                }
                info!(
                    session_id = %session_id,
                    fps = ?snapshot.fps,
                    gauges = ?snapshot.gauges,
                    series = ?snapshot.series,
                    "depth stream stats",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_payload;
    use crate::inference::SyntheticDepthEstimator;
    use crate::video::{FrameInfo, FrameSource, VideoMetadata};
    use ndarray::Array3;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    struct FixedFrameSource {
        frame: Array3<u8>,
        meta: VideoMetadata,
    }

    impl FrameSource for FixedFrameSource {
        fn decode_at(&self, time_ms: f64) -> crate::error::Result<(Array3<u8>, FrameInfo)> {
            Ok((
                self.frame.clone(),
                FrameInfo {
                    time_ms,
                    index: -1,
                    pts: None,
                    key_frame: true,
                },
            ))
        }

        fn metadata(&self) -> VideoMetadata {
            self.meta.clone()
        }
    }

    /// A frame source whose `decode_at` blocks for a caller-supplied delay
    /// keyed by the requested `time_ms`, so tests can make requests finish
    /// in a different order than they arrived.
    struct LatencyFrameSource {
        frame: Array3<u8>,
        meta: VideoMetadata,
        delays_ms: HashMap<u64, u64>,
    }

    impl FrameSource for LatencyFrameSource {
        fn decode_at(&self, time_ms: f64) -> crate::error::Result<(Array3<u8>, FrameInfo)> {
            if let Some(delay) = self.delays_ms.get(&(time_ms as u64)) {
                std::thread::sleep(StdDuration::from_millis(*delay));
            }
            Ok((
                self.frame.clone(),
                FrameInfo {
                    time_ms,
                    index: -1,
                    pts: None,
                    key_frame: true,
                },
            ))
        }

        fn metadata(&self) -> VideoMetadata {
            self.meta.clone()
        }
    }

    fn test_frame_and_meta() -> (Array3<u8>, VideoMetadata) {
        let frame = Array3::from_shape_fn((8, 8, 3), |(y, x, c)| ((y + x + c) * 7) as u8);
        let meta = VideoMetadata {
            width: 8,
            height: 8,
            frames: Some(10),
            fps: 30.0,
            duration_ms: Some(333.0),
        };
        (frame, meta)
    }

    /// Builds a session registered with a fresh `SessionManager`, so the
    /// processor's per-dequeue re-lookup has something to find (and, in the
    /// deletion test, to stop finding).
    async fn test_session_and_manager() -> (Arc<SessionManager>, Arc<Session>) {
        let (frame, meta) = test_frame_and_meta();
        let source: Arc<dyn FrameSource> = Arc::new(FixedFrameSource { frame, meta: meta.clone() });
        let session = Session::new("test-session".to_string(), "/tmp/test.mp4".into(), meta, source, 8, 640);
        let manager = SessionManager::new(Arc::new(Settings::default()));
        manager.insert(session.clone()).await;
        (manager, session)
    }

    #[tokio::test]
    async fn a_single_request_produces_one_wire_payload() {
        let (manager, session) = test_session_and_manager().await;
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(4);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(4);

        let handle = spawn(manager, session, engine, settings, incoming_rx, outgoing_tx);

        incoming_tx.send(r#"{"time_ms": 10.0}"#.to_string()).await.unwrap();

        let payload = timeout(StdDuration::from_secs(5), outgoing_rx.recv())
            .await
            .expect("payload arrived before timeout")
            .expect("channel stayed open");
        assert_eq!(&payload[0..4], b"VDZ1");

        let _ = handle.stop.send(true);
        drop(incoming_tx);
        timeout(StdDuration::from_secs(5), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_without_crashing_the_pipeline() {
        let (manager, session) = test_session_and_manager().await;
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(4);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(4);

        let handle = spawn(manager, session, engine, settings, incoming_rx, outgoing_tx);

        incoming_tx.send("not json".to_string()).await.unwrap();
        incoming_tx.send(r#"{"time_ms": 5.0}"#.to_string()).await.unwrap();

        let payload = timeout(StdDuration::from_secs(5), outgoing_rx.recv())
            .await
            .expect("payload arrived before timeout")
            .expect("channel stayed open");
        assert_eq!(&payload[0..4], b"VDZ1");

        let _ = handle.stop.send(true);
        drop(incoming_tx);
        timeout(StdDuration::from_secs(5), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_incoming_channel_winds_the_pipeline_down() {
        let (manager, session) = test_session_and_manager().await;
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(4);
        let (outgoing_tx, _outgoing_rx) = mpsc::channel::<Vec<u8>>(4);

        let handle = spawn(manager, session, engine, settings, incoming_rx, outgoing_tx);
        drop(incoming_tx);

        timeout(StdDuration::from_secs(5), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn deleting_the_session_mid_stream_stops_the_pipeline() {
        let (manager, session) = test_session_and_manager().await;
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(4);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(4);

        let handle = spawn(manager.clone(), session.clone(), engine, settings, incoming_rx, outgoing_tx);

        incoming_tx.send(r#"{"time_ms": 10.0}"#.to_string()).await.unwrap();
        let first = timeout(StdDuration::from_secs(5), outgoing_rx.recv())
            .await
            .expect("first payload arrived before timeout")
            .expect("channel stayed open");
        assert_eq!(&first[0..4], b"VDZ1");

        manager.delete_session(&session.session_id).await.unwrap();

        // The processor only re-checks the session on its next dequeue, so
        // a further request is what surfaces the deletion.
        incoming_tx.send(r#"{"time_ms": 20.0}"#.to_string()).await.unwrap();

        timeout(StdDuration::from_secs(5), handle.join())
            .await
            .expect("pipeline stops once the session vanishes");

        assert!(
            timeout(StdDuration::from_millis(200), outgoing_rx.recv())
                .await
                .map(|v| v.is_none())
                .unwrap_or(true),
            "no payload should be sent for a request after the session was deleted"
        );
    }

    #[tokio::test]
    async fn out_of_order_completion_still_emits_payloads_in_request_order() {
        let (frame, meta) = test_frame_and_meta();
        let mut delays_ms = HashMap::new();
        delays_ms.insert(10, 150);
        delays_ms.insert(20, 20);
        delays_ms.insert(30, 5);
        let source: Arc<dyn FrameSource> = Arc::new(LatencyFrameSource { frame, meta: meta.clone(), delays_ms });
        let session = Session::new("reorder-session".to_string(), "/tmp/reorder.mp4".into(), meta, source, 8, 640);
        let manager = SessionManager::new(Arc::new(Settings::default()));
        manager.insert(session.clone()).await;

        // Wide enough that all three requests run concurrently instead of
        // queueing behind each other through the inference gate.
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 4));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(8);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(8);

        let handle = spawn(manager, session, engine, settings, incoming_rx, outgoing_tx);

        for time_ms in [10.0, 20.0, 30.0] {
            incoming_tx
                .send(format!(r#"{{"time_ms": {time_ms}}}"#))
                .await
                .unwrap();
        }

        let mut received_order = Vec::new();
        for _ in 0..3 {
            let payload = timeout(StdDuration::from_secs(5), outgoing_rx.recv())
                .await
                .expect("payload arrived before timeout")
                .expect("channel stayed open");
            let (header, _) = decode_payload(&payload).expect("well-formed wire payload");
            received_order.push(header.timestamp_ms);
        }

        // Request for time_ms=10 is the slowest to decode, yet it must still
        // be the first payload on the wire: egress order follows dequeue
        // order, not completion order.
        assert_eq!(received_order, vec![10, 20, 30]);

        let _ = handle.stop.send(true);
        drop(incoming_tx);
        timeout(StdDuration::from_secs(5), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn a_cache_hit_is_markedly_faster_than_the_initial_decode() {
        let (frame, meta) = test_frame_and_meta();
        let mut delays_ms = HashMap::new();
        delays_ms.insert(500, 80);
        let source: Arc<dyn FrameSource> = Arc::new(LatencyFrameSource { frame, meta: meta.clone(), delays_ms });
        let session = Session::new("cache-hit-session".to_string(), "/tmp/cache-hit.mp4".into(), meta, source, 8, 640);
        let manager = SessionManager::new(Arc::new(Settings::default()));
        manager.insert(session.clone()).await;

        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let settings = Arc::new(Settings::default());

        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(4);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(4);

        let handle = spawn(manager, session, engine, settings, incoming_rx, outgoing_tx);

        let first_start = Instant::now();
        incoming_tx.send(r#"{"time_ms": 500.0}"#.to_string()).await.unwrap();
        timeout(StdDuration::from_secs(5), outgoing_rx.recv())
            .await
            .expect("first payload arrived before timeout")
            .expect("channel stayed open");
        let first_elapsed = first_start.elapsed();

        let second_start = Instant::now();
        incoming_tx.send(r#"{"time_ms": 500.0}"#.to_string()).await.unwrap();
        timeout(StdDuration::from_secs(5), outgoing_rx.recv())
            .await
            .expect("second payload arrived before timeout")
            .expect("channel stayed open");
        let second_elapsed = second_start.elapsed();

        assert!(
            second_elapsed < first_elapsed / 2,
            "cache hit ({second_elapsed:?}) should be well under half of the initial decode ({first_elapsed:?})"
        );

        let _ = handle.stop.send(true);
        drop(incoming_tx);
        timeout(StdDuration::from_secs(5), handle.join()).await.unwrap();
    }
}
