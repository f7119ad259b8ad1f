//! End-to-end tests for the pump core.
//!
//! These tests drive real pipelines on the tokio runtime: sources, triggers,
//! generators, worker pools and cross-pipeline routing.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pump_core::common::{CollectSink, IteratorSource, ManualSource};
use pump_core::config::{InternalSourceConfig, OobConfig};
use pump_core::trigger::{RunOnceTrigger, TriggerFlag};
use pump_core::{
    BusMessage, CancellationToken, Context, CycleSource, Generator, Injector, InternalSource,
    OobGenerator, OobProcessor, Outcome, Pipeline, PipelineBuilder, Processor, PumpError,
    PumpService, Result, RouterSink, Topic, Trigger, TriggerSource,
};
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Receive bus messages until one with `topic` arrives.
async fn wait_topic(rx: &mut broadcast::Receiver<BusMessage>, topic: Topic) -> BusMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = rx.recv().await.expect("bus closed");
            if msg.topic == topic {
                return msg;
            }
        }
    })
    .await
    .expect("topic not published in time")
}

struct UpperCase;

impl Processor<String> for UpperCase {
    fn name(&self) -> &str {
        "UpperCaseProcessor"
    }

    fn process(&self, _context: &Context, event: String) -> Result<Outcome<String>> {
        Ok(Outcome::Next(event.to_uppercase()))
    }
}

struct SplitIntoChars;

#[async_trait]
impl Generator<String> for SplitIntoChars {
    fn name(&self) -> &str {
        "SplitIntoCharsGenerator"
    }

    async fn generate(
        &self,
        context: Context,
        event: String,
        depth: usize,
        injector: &Injector<String>,
    ) -> Result<()> {
        for c in event.chars() {
            injector.inject(context.clone(), c.to_string(), depth)?;
        }
        Ok(())
    }
}

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_uppercase_reaches_sink_exactly_once() {
        init_tracing();
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("scenario-a")
            .source(ManualSource::new("manual"))
            .processor(UpperCase)
            .sink(sink.clone())
            .build()
            .expect("valid pipeline");
        assert_eq!(pipeline.depth_count(), 1);

        pipeline
            .process(Context::new(), "abc".to_string())
            .expect("event consumed");
        assert_eq!(sink.events(), vec!["ABC".to_string()]);
    }

    #[tokio::test]
    async fn test_generator_delivers_each_char_separately() {
        init_tracing();
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("scenario-b")
            .source(ManualSource::new("manual"))
            .generator(SplitIntoChars)
            .sink(sink.clone())
            .build()
            .expect("valid pipeline");
        assert_eq!(pipeline.depth_count(), 2);
        pipeline.start();

        pipeline
            .process(Context::new(), "abc".to_string())
            .expect("event handed to generator");
        eventually(|| sink.len() == 3).await;
        assert_eq!(sink.events(), vec!["a", "b", "c"]);
        assert_eq!(pipeline.metrics().events_in(), 1);
        assert_eq!(pipeline.metrics().events_out(), 3);

        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_delivers_results_of_finished_generators() {
        init_tracing();
        for round in 0..20 {
            let sink = CollectSink::new();
            let pipeline = PipelineBuilder::new("split-then-stop")
                .source(ManualSource::new("manual"))
                .generator(SplitIntoChars)
                .sink(sink.clone())
                .build()
                .expect("valid pipeline");
            pipeline.start();

            for _ in 0..20 {
                pipeline
                    .process(Context::new(), "abc".to_string())
                    .expect("event handed to generator");
            }
            pipeline.stop().await;
            assert_eq!(sink.len(), 60, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_unconsumed_event_is_construction_error() {
        let pipeline = PipelineBuilder::new("no-sink")
            .source(ManualSource::new("manual"))
            .processor(UpperCase)
            .build()
            .expect("builds without sink");

        let err = pipeline
            .process(Context::new(), "abc".to_string())
            .expect_err("event escaped the last depth");
        assert!(err.is_construction());
    }

    #[tokio::test]
    async fn test_ready_pending_until_every_token_removed() {
        let pipeline = PipelineBuilder::new("tokens")
            .source(ManualSource::new("manual"))
            .sink(CollectSink::<String>::new())
            .build()
            .expect("valid pipeline");

        pipeline.throttle("A", true);
        pipeline.throttle("B", true);
        pipeline.throttle("A", false);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pipeline.ready())
                .await
                .is_err(),
            "ready() resolved while B is still held"
        );

        pipeline.throttle("B", false);
        tokio::time::timeout(Duration::from_secs(1), pipeline.ready())
            .await
            .expect("ready once the set is empty");
    }
}

mod backpressure_tests {
    use super::*;

    #[tokio::test]
    async fn test_internal_source_watermarks() {
        init_tracing();
        let source = InternalSource::new("in", InternalSourceConfig::new(10, 0.8)).expect("config");
        let pipeline = PipelineBuilder::new("scenario-c")
            .source(source.clone())
            .sink(CollectSink::<u32>::new())
            .build()
            .expect("valid pipeline");

        let on = Arc::new(AtomicUsize::new(0));
        let off = Arc::new(AtomicUsize::new(0));
        {
            let on = on.clone();
            let off = off.clone();
            pipeline.bus().listen(
                &[Topic::BackpressureOn, Topic::BackpressureOff],
                move |msg: &BusMessage| match msg.topic {
                    Topic::BackpressureOn => {
                        on.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {
                        off.fetch_add(1, Ordering::SeqCst);
                    }
                },
            );
        }

        for i in 0..7 {
            source.put(Context::new(), i).expect("room in queue");
        }
        assert!(!source.is_backpressured());
        source.put(Context::new(), 7).expect("room in queue");
        assert!(source.is_backpressured());
        assert_eq!(on.load(Ordering::SeqCst), 1);

        source.put(Context::new(), 8).expect("room in queue");
        assert_eq!(on.load(Ordering::SeqCst), 1);

        while source.len() > 6 {
            source.try_get().expect("queued item");
        }
        assert!(!source.is_backpressured());
        assert_eq!(off.load(Ordering::SeqCst), 1);

        while source.try_get().is_some() {}
        assert_eq!(off.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_router_mirrors_downstream_state() {
        init_tracing();
        let service = Arc::new(PumpService::new());
        let target = InternalSource::new("in", InternalSourceConfig::new(4, 0.5)).expect("config");
        let delivered = CollectSink::new();
        let downstream = PipelineBuilder::new("down")
            .source(target.clone())
            .sink(delivered.clone())
            .build()
            .expect("valid pipeline");
        let upstream = PipelineBuilder::new("up")
            .source(ManualSource::new("manual"))
            .sink(RouterSink::fixed("route", &service, "down.in"))
            .build()
            .expect("valid pipeline");
        service.add_pipeline(upstream.clone()).expect("unique id");
        service.add_pipeline(downstream.clone()).expect("unique id");

        upstream.process(Context::new(), 1u32).expect("routed");
        upstream.process(Context::new(), 2u32).expect("routed");
        assert!(!upstream.is_ready(), "downstream queue reached its watermark");

        service.start();
        eventually(|| delivered.len() == 2).await;
        eventually(|| upstream.is_ready()).await;

        downstream.set_error(Context::new(), None, Some(PumpError::config("broken")));
        assert!(!upstream.is_ready());
        service.clear_errors();
        assert!(upstream.is_ready());

        service.stop().await;
    }
}

mod trigger_tests {
    use super::*;

    #[test]
    fn test_bounded_fire_is_fair() {
        let trigger = Trigger::new("scenario-d").with_max_triggered(2);
        let flags: Vec<_> = (0..5)
            .map(|i| {
                let flag = Arc::new(TriggerFlag::new(format!("source-{i}")));
                trigger.add(flag.clone());
                flag
            })
            .collect();

        let mut chosen = HashSet::new();
        for _ in 0..500 {
            assert_eq!(trigger.fire(), 2);
            assert_eq!(flags.iter().filter(|f| f.is_armed()).count(), 2);
            for flag in flags.iter().filter(|f| f.is_armed()) {
                chosen.insert(flag.id().to_string());
                flag.clear();
            }
        }
        assert_eq!(chosen.len(), 5);
    }

    struct Failing {
        suppressed: bool,
    }

    #[async_trait]
    impl CycleSource<String> for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        async fn cycle(&self, _pipeline: &Arc<Pipeline<String>>) -> Result<()> {
            if self.suppressed {
                Err(PumpError::processing("parser", std::io::Error::other("invalid value")))
            } else {
                Err(PumpError::other(std::io::Error::other("runtime failure")))
            }
        }
    }

    async fn run_failing_cycle(suppressed: bool) -> Arc<Pipeline<String>> {
        let trigger = Arc::new(Trigger::new("manual"));
        let pipeline = PipelineBuilder::new("scenario-e")
            .source(TriggerSource::new(Failing { suppressed }).on(&trigger))
            .sink(CollectSink::<String>::new())
            .error_handler(|cause: &PumpError, _: &Context, _: Option<&String>| {
                !matches!(cause, PumpError::Processing { .. })
            })
            .build()
            .expect("valid pipeline");
        let mut bus = pipeline.bus().subscribe();
        pipeline.start();

        trigger.fire();
        wait_topic(&mut bus, Topic::CycleEnd).await;
        pipeline
    }

    #[tokio::test]
    async fn test_suppressed_errors_keep_pipeline_running() {
        init_tracing();
        let pipeline = run_failing_cycle(true).await;
        assert!(!pipeline.is_error());
        assert_eq!(pipeline.metrics().snapshot().suppressed, 1);
        pipeline.stop().await;

        let pipeline = run_failing_cycle(false).await;
        assert!(pipeline.is_error());
        assert!(!pipeline.is_ready());
        pipeline.stop().await;
    }

    /// Fails with an unsuppressed error on its first run only.
    struct FailsOnce {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CycleSource<String> for FailsOnce {
        fn id(&self) -> &str {
            "fails-once"
        }

        async fn cycle(&self, _pipeline: &Arc<Pipeline<String>>) -> Result<()> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PumpError::other(std::io::Error::other("runtime failure")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_errored_pipeline_stalls_until_errors_cleared() {
        init_tracing();
        let runs = Arc::new(AtomicUsize::new(0));
        let service = PumpService::new();
        let trigger = Arc::new(Trigger::new("manual"));
        let pipeline = PipelineBuilder::new("stalled")
            .source(TriggerSource::new(FailsOnce { runs: runs.clone() }).on(&trigger))
            .sink(CollectSink::<String>::new())
            .build()
            .expect("valid pipeline");
        service.add_pipeline(pipeline.clone()).expect("unique id");
        let mut bus = pipeline.bus().subscribe();
        service.start();

        trigger.fire();
        wait_topic(&mut bus, Topic::CycleEnd).await;
        assert!(pipeline.is_error());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        trigger.fire();
        let stalled = tokio::time::timeout(Duration::from_millis(100), async {
            loop {
                if bus.recv().await.expect("bus open").topic == Topic::CycleBegin {
                    return;
                }
            }
        })
        .await;
        assert!(stalled.is_err(), "cycle ran while the pipeline was in error");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        service.clear_errors();
        wait_topic(&mut bus, Topic::CycleBegin).await;
        wait_topic(&mut bus, Topic::CycleEnd).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!pipeline.is_error());
        assert!(pipeline.is_ready());

        service.stop().await;
    }

    struct Endless;

    #[async_trait]
    impl CycleSource<String> for Endless {
        fn id(&self) -> &str {
            "endless"
        }

        async fn cycle(&self, _pipeline: &Arc<Pipeline<String>>) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_running_cycle() {
        let trigger = Arc::new(Trigger::new("manual"));
        let pipeline = PipelineBuilder::new("endless")
            .source(TriggerSource::new(Endless).on(&trigger))
            .sink(CollectSink::<String>::new())
            .build()
            .expect("valid pipeline");
        let mut bus = pipeline.bus().subscribe();
        pipeline.start();

        trigger.fire();
        wait_topic(&mut bus, Topic::CycleBegin).await;
        pipeline.stop().await;

        let msg = wait_topic(&mut bus, Topic::CycleCanceled).await;
        assert_eq!(&*msg.origin, "endless");
        assert!(!pipeline.is_error());
    }

    #[tokio::test]
    async fn test_run_once_requests_shutdown_after_cycle() {
        init_tracing();
        let service = Arc::new(PumpService::new());
        let trigger = Arc::new(Trigger::new("once"));
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::new("batch")
            .source(
                TriggerSource::new(IteratorSource::new("lines", ["x", "y", "z"].map(String::from)))
                    .on(&trigger),
            )
            .processor(UpperCase)
            .sink(sink.clone())
            .build()
            .expect("valid pipeline");
        service.add_pipeline(pipeline.clone()).expect("unique id");
        service.start();

        let policy = RunOnceTrigger::new(trigger.clone(), service.shutdown_token())
            .spawn(CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(2), service.wait_for_shutdown())
            .await
            .expect("shutdown requested");
        policy.await.expect("policy task");

        assert_eq!(sink.events(), vec!["X", "Y", "Z"]);
        service.stop().await;
    }
}

mod oob_tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl OobProcessor<String> for Slow {
        async fn process_oob(&self, _context: &Context, event: String) -> Result<Option<String>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Some(event.repeat(2)))
        }
    }

    #[tokio::test]
    async fn test_sentinels_stop_every_worker() {
        init_tracing();
        let oob = Arc::new(
            OobGenerator::new(
                "slow",
                Slow,
                OobConfig {
                    queue_max_size: 8,
                    num_of_workers: 3,
                },
            )
            .expect("config"),
        );
        let sink = CollectSink::new();
        let pipeline = PipelineBuilder::<String>::new("oob")
            .source(ManualSource::new("manual"))
            .generator_arc(oob.clone())
            .sink(sink.clone())
            .build()
            .expect("valid pipeline");
        pipeline.start();
        assert_eq!(oob.active_workers(), 3);

        for word in ["a", "b", "c", "d"] {
            pipeline
                .process(Context::new(), word.to_string())
                .expect("queued");
        }
        eventually(|| sink.len() == 4).await;

        oob.drain().await;
        assert_eq!(oob.active_workers(), 0);
        assert_eq!(oob.queue_len(), 0);

        let mut got = sink.events();
        got.sort();
        assert_eq!(got, vec!["aa", "bb", "cc", "dd"]);
        pipeline.stop().await;
    }

    struct Echo;

    #[async_trait]
    impl OobProcessor<String> for Echo {
        async fn process_oob(&self, _context: &Context, event: String) -> Result<Option<String>> {
            tokio::task::yield_now().await;
            Ok(Some(event))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_delivers_every_queued_result() {
        init_tracing();
        for round in 0..20 {
            let oob = Arc::new(
                OobGenerator::new(
                    "echo",
                    Echo,
                    OobConfig {
                        queue_max_size: 16,
                        num_of_workers: 4,
                    },
                )
                .expect("config"),
            );
            let sink = CollectSink::new();
            let pipeline = PipelineBuilder::<String>::new("oob-stop")
                .source(ManualSource::new("manual"))
                .generator_arc(oob.clone())
                .sink(sink.clone())
                .build()
                .expect("valid pipeline");
            pipeline.start();

            for i in 0..50 {
                pipeline
                    .process(Context::new(), i.to_string())
                    .expect("queued");
            }
            pipeline.stop().await;

            assert_eq!(oob.active_workers(), 0, "round {round}");
            assert_eq!(sink.len(), 50, "round {round}");
        }
    }
}
