//! The three-stage brand-strategy pipeline.
//!
//! Stages run strictly in order and each prompt embeds the output of the
//! stages before it. The first failure short-circuits everything after it.

use crate::cleanup;
use crate::config::PipelineConfig;
use crate::generator::{GenerationError, TextGenerator};
use crate::page::Page;
use crate::prompt::{self, PromptTemplate};
use crate::state::FormSubmission;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Segmentation,
    TargetLens,
    MarketRadar,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 3] = [Stage::Segmentation, Stage::TargetLens, Stage::MarketRadar];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Segmentation => "Segmentation",
            Stage::TargetLens => "Target Lens",
            Stage::MarketRadar => "Market Radar",
        }
    }

    /// Page that displays this stage's output.
    pub fn page(&self) -> Page {
        match self {
            Stage::Segmentation => Page::Segment,
            Stage::TargetLens => Page::Target,
            Stage::MarketRadar => Page::Market,
        }
    }

    pub fn for_page(page: Page) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.page() == page)
    }

    pub fn template(&self) -> PromptTemplate {
        match self {
            Stage::Segmentation => prompt::SEGMENTATION,
            Stage::TargetLens => prompt::TARGET_LENS,
            Stage::MarketRadar => prompt::MARKET_RADAR,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a stage produced: cleaned Markdown (plus the raw reply) or an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageOutput {
    Ready { raw: String, markdown: String },
    Failed { message: String },
}

impl StageOutput {
    pub const ERROR_MARKER: &'static str = "Error:";

    pub fn failed(err: &GenerationError) -> Self {
        StageOutput::Failed {
            message: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StageOutput::Failed { .. })
    }

    pub fn markdown(&self) -> Option<&str> {
        match self {
            StageOutput::Ready { markdown, .. } => Some(markdown),
            StageOutput::Failed { .. } => None,
        }
    }

    /// User-visible text. Failures carry the `Error:` prefix.
    pub fn display_text(&self) -> String {
        match self {
            StageOutput::Ready { markdown, .. } => markdown.clone(),
            StageOutput::Failed { message } => format!("{} {message}", Self::ERROR_MARKER),
        }
    }
}

/// Inputs available to a stage's prompt.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub idea: &'a str,
    pub launch_plan: &'a str,
    pub segmentation: Option<&'a str>,
    pub target_lens: Option<&'a str>,
}

impl<'a> StageContext<'a> {
    pub fn new(submission: &'a FormSubmission) -> Self {
        Self {
            idea: submission.idea(),
            launch_plan: submission.launch_plan(),
            segmentation: None,
            target_lens: None,
        }
    }

    pub fn prompt(&self, stage: Stage) -> String {
        let mut values = vec![("idea", self.idea), ("launch_plan", self.launch_plan)];
        if let Some(segmentation) = self.segmentation {
            values.push(("segmentation", segmentation));
        }
        if let Some(target_lens) = self.target_lens {
            values.push(("target_lens", target_lens));
        }
        stage.template().fill(&values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub segmentation: StageOutput,
    pub target_lens: StageOutput,
    pub market_radar: StageOutput,
}

impl PipelineReport {
    pub fn output(&self, stage: Stage) -> &StageOutput {
        match stage {
            Stage::Segmentation => &self.segmentation,
            Stage::TargetLens => &self.target_lens,
            Stage::MarketRadar => &self.market_radar,
        }
    }

    pub fn succeeded(&self) -> bool {
        Stage::ALL.iter().all(|stage| !self.output(*stage).is_error())
    }
}

#[derive(Clone)]
pub struct Pipeline {
    generator: Option<Arc<dyn TextGenerator>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>, config: PipelineConfig) -> Self {
        Self { generator, config }
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Runs every stage in order. `on_stage` sees each output as soon as it exists.
    pub async fn run<F>(&self, submission: &FormSubmission, mut on_stage: F) -> PipelineReport
    where
        F: FnMut(Stage, &StageOutput),
    {
        let started = Instant::now();
        let mut failed: Option<Stage> = None;
        let mut segmentation: Option<String> = None;
        let mut target_lens: Option<String> = None;
        let mut outputs = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            let output = match failed {
                Some(upstream) => StageOutput::failed(&GenerationError::DependencyFailed {
                    upstream: upstream.label(),
                }),
                None => {
                    let context = StageContext {
                        segmentation: segmentation.as_deref(),
                        target_lens: target_lens.as_deref(),
                        ..StageContext::new(submission)
                    };
                    match self.run_stage(stage, &context).await {
                        Ok(output) => output,
                        Err(err) => {
                            warn!(stage = %stage, error = %err, "stage failed; skipping the rest");
                            failed = Some(stage);
                            StageOutput::failed(&err)
                        }
                    }
                }
            };
            if let Some(markdown) = output.markdown() {
                match stage {
                    Stage::Segmentation => segmentation = Some(markdown.to_string()),
                    Stage::TargetLens => target_lens = Some(markdown.to_string()),
                    Stage::MarketRadar => {}
                }
            }
            on_stage(stage, &output);
            outputs.push(output);
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed_stage = failed.map(|stage| stage.label()),
            "pipeline finished"
        );
        let mut outputs = outputs.into_iter();
        let mut next = || {
            outputs
                .next()
                .unwrap_or_else(|| StageOutput::failed(&GenerationError::EmptyResponse))
        };
        PipelineReport {
            segmentation: next(),
            target_lens: next(),
            market_radar: next(),
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        context: &StageContext<'_>,
    ) -> Result<StageOutput, GenerationError> {
        let generator = self
            .generator
            .as_deref()
            .ok_or(GenerationError::NotConfigured)?;
        let prompt = context.prompt(stage);
        info!(stage = %stage, model = generator.model(), prompt_chars = prompt.len(), "calling generator");

        let raw = match generator.generate(&prompt).await {
            Err(err) if err.is_rate_limited() && self.config.retry_on_rate_limit => {
                warn!(
                    stage = %stage,
                    backoff_ms = self.config.rate_limit_backoff.as_millis() as u64,
                    "rate limited; retrying once"
                );
                tokio::time::sleep(self.config.rate_limit_backoff).await;
                generator.generate(&prompt).await?
            }
            result => result?,
        };

        let markdown = cleanup::clean(&raw);
        if markdown.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(StageOutput::Ready { raw, markdown })
    }
}
