use crate::page::Page;
use crate::pipeline::{Stage, StageOutput};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Theme::Light => write!(f, "light"),
            Theme::Dark => write!(f, "dark"),
        }
    }
}

/// Everything one visitor's session remembers between requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub current_page: Page,
    pub theme: Theme,
    pub startup_idea: Option<String>,
    pub startup_launch_plan: Option<String>,
    pub generating: bool,
    pub segmentation_output: Option<StageOutput>,
    pub target_lens_output: Option<StageOutput>,
    pub market_radar_output: Option<StageOutput>,
}

impl SessionState {
    pub fn output(&self, stage: Stage) -> Option<&StageOutput> {
        match stage {
            Stage::Segmentation => self.segmentation_output.as_ref(),
            Stage::TargetLens => self.target_lens_output.as_ref(),
            Stage::MarketRadar => self.market_radar_output.as_ref(),
        }
    }

    fn output_slot(&mut self, stage: Stage) -> &mut Option<StageOutput> {
        match stage {
            Stage::Segmentation => &mut self.segmentation_output,
            Stage::TargetLens => &mut self.target_lens_output,
            Stage::MarketRadar => &mut self.market_radar_output,
        }
    }

    pub fn has_outputs(&self) -> bool {
        Stage::ALL.iter().any(|stage| self.output(*stage).is_some())
    }
}

/// A validated form submission. Both fields are trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSubmission {
    idea: String,
    launch_plan: String,
}

impl FormSubmission {
    pub fn new(idea: &str, launch_plan: &str) -> Result<Self, ValidationError> {
        let idea = idea.trim();
        let launch_plan = launch_plan.trim();
        match (idea.is_empty(), launch_plan.is_empty()) {
            (true, true) => Err(ValidationError::MissingBoth),
            (true, false) => Err(ValidationError::MissingIdea),
            (false, true) => Err(ValidationError::MissingLaunchPlan),
            (false, false) => Ok(Self {
                idea: idea.to_string(),
                launch_plan: launch_plan.to_string(),
            }),
        }
    }

    pub fn idea(&self) -> &str {
        &self.idea
    }

    pub fn launch_plan(&self) -> &str {
        &self.launch_plan
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please describe your startup idea.")]
    MissingIdea,
    #[error("Please describe your launch plan.")]
    MissingLaunchPlan,
    #[error("Please fill in both your startup idea and your launch plan.")]
    MissingBoth,
}

#[derive(Debug, Clone)]
pub enum Action {
    Navigate(Page),
    SetTheme(Theme),
    ToggleTheme,
    Submit(FormSubmission),
    StageCompleted { stage: Stage, output: StageOutput },
    GenerationFinished,
}

pub fn reduce(mut state: SessionState, action: Action) -> SessionState {
    match action {
        Action::Navigate(page) => state.current_page = page,
        Action::SetTheme(theme) => state.theme = theme,
        Action::ToggleTheme => state.theme = state.theme.toggled(),
        Action::Submit(submission) => {
            state.startup_idea = Some(submission.idea);
            state.startup_launch_plan = Some(submission.launch_plan);
            state.segmentation_output = None;
            state.target_lens_output = None;
            state.market_radar_output = None;
            state.generating = true;
            state.current_page = Page::Segment;
        }
        Action::StageCompleted { stage, output } => {
            *state.output_slot(stage) = Some(output);
        }
        Action::GenerationFinished => state.generating = false,
    }
    state
}
