//! Demo stages for text events.

use std::sync::Arc;

use pump_core::StageRegistry;
use pump_core::common::{FnProcessor, FnSink, IteratorGenerator, IteratorSource};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct LinesArgs {
    #[serde(default)]
    lines: Vec<String>,
}

/// Registry with the built-in stages plus `lines`, `uppercase`,
/// `split_words` and `print`.
pub fn registry() -> StageRegistry<String> {
    let mut registry = StageRegistry::with_builtins();

    registry.register_source("lines", |def, ctx| {
        let args: LinesArgs = def.parse_args()?;
        ctx.trigger_source(def, IteratorSource::new(def.id_or_kind(), args.lines))
    });
    registry.register_processor("uppercase", |def, _| {
        Ok(Arc::new(FnProcessor::map(def.id_or_kind(), |line: String| {
            line.to_uppercase()
        })))
    });
    registry.register_generator("split_words", |def, _| {
        Ok(Arc::new(IteratorGenerator::new(
            def.id_or_kind(),
            |_, line: String| {
                line.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            },
        )))
    });
    registry.register_sink("print", |def, _| {
        Ok(Arc::new(FnSink::new(def.id_or_kind(), |_, line: String| {
            println!("{line}");
            Ok(())
        })))
    });

    registry
}
