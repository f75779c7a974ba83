use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder regex"));

/// A prompt with `{name}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub body: &'static str,
}

impl PromptTemplate {
    /// Substitutes every placeholder in one pass, so values are never re-expanded.
    /// Placeholders without a value are left untouched.
    pub fn fill(&self, values: &[(&str, &str)]) -> String {
        PLACEHOLDER
            .replace_all(self.body, |caps: &Captures<'_>| {
                let key = &caps[1];
                values
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| (*value).to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn placeholders(&self) -> Vec<&'static str> {
        PLACEHOLDER
            .captures_iter(self.body)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect()
    }
}

pub const SEGMENTATION: PromptTemplate = PromptTemplate {
    name: "segmentation",
    body: r#"You are a senior brand strategist advising an early-stage founder.

Startup idea:
{idea}

Launch plan:
{launch_plan}

Write a market segmentation report in Markdown with these sections:
1. **Primary market**: the single market to win first and why.
2. **Customer segments**: 3 to 5 segments, each with a short profile, core need, and willingness to pay.
3. **Prioritization**: rank the segments and justify the order.
4. **Positioning**: a one-sentence positioning statement for the top segment.
5. **Risks**: the main risks to this segmentation and how to test them cheaply.

Use `###` headings for each section. Where a visual would help, write
[Generate and embed the image here] on its own line. Do not wrap the answer in code fences."#,
};

pub const TARGET_LENS: PromptTemplate = PromptTemplate {
    name: "target_lens",
    body: r#"You are a competitive-intelligence analyst.

Startup idea:
{idea}

Launch plan:
{launch_plan}

Segmentation report from the previous step:
{segmentation}

Identify the 4 to 6 most relevant competitors (direct and indirect) for the
top-priority segment. For each, give a one-line description and its main
weakness. Then produce a Markdown comparison table with columns:
Competitor | Target segment | Pricing | Key strength | Key weakness | Our edge.
Finish with three bullet points on where this startup can differentiate.
Do not wrap the answer in code fences."#,
};

pub const MARKET_RADAR: PromptTemplate = PromptTemplate {
    name: "market_radar",
    body: r#"You are a growth marketer planning a launch campaign.

Startup idea:
{idea}

Launch plan:
{launch_plan}

Segmentation report:
{segmentation}

Competitive analysis:
{target_lens}

For each of the top three segments, estimate in Markdown:
- addressable audience size in the launch geography (with the assumption behind the number),
- the best two acquisition channels and an expected cost per acquisition range,
- a sample ad headline and a one-line message.
Present the estimates as a Markdown table, then add a short "First 30 days" checklist.
Do not wrap the answer in code fences."#,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_replaces_known_placeholders() {
        let prompt = SEGMENTATION.fill(&[
            ("idea", "AI tutoring app"),
            ("launch_plan", "Launch in Mumbai"),
        ]);
        assert!(prompt.contains("AI tutoring app"));
        assert!(prompt.contains("Launch in Mumbai"));
        assert!(!prompt.contains("{idea}"));
        assert!(!prompt.contains("{launch_plan}"));
    }

    #[test]
    fn values_are_not_re_expanded() {
        let template = PromptTemplate {
            name: "t",
            body: "{idea} / {launch_plan}",
        };
        let prompt = template.fill(&[("idea", "{launch_plan}"), ("launch_plan", "plan")]);
        assert_eq!(prompt, "{launch_plan} / plan");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let template = PromptTemplate {
            name: "t",
            body: "{idea} {missing}",
        };
        assert_eq!(template.fill(&[("idea", "x")]), "x {missing}");
    }

    #[test]
    fn each_stage_template_declares_its_context() {
        assert_eq!(SEGMENTATION.placeholders(), vec!["idea", "launch_plan"]);
        assert!(TARGET_LENS.placeholders().contains(&"segmentation"));
        let radar = MARKET_RADAR.placeholders();
        assert!(radar.contains(&"segmentation"));
        assert!(radar.contains(&"target_lens"));
    }
}
