use serde::{Deserialize, Serialize};
use std::fmt;

/// Every page the site can render. The set is closed; anything a client sends
/// that does not parse resolves to [`Page::Home`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Page {
    #[default]
    Home,
    Segment,
    Target,
    Market,
    Roadmap,
    Pricing,
}

impl Page {
    /// Pages in nav-bar order. The position doubles as the `?page=N` index.
    pub const ALL: [Page; 6] = [
        Page::Home,
        Page::Segment,
        Page::Target,
        Page::Market,
        Page::Roadmap,
        Page::Pricing,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Page::Home => "home",
            Page::Segment => "segment",
            Page::Target => "target",
            Page::Market => "market",
            Page::Roadmap => "roadmap",
            Page::Pricing => "pricing",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Page::Home => "Home",
            Page::Segment => "Segmentation",
            Page::Target => "Target Lens",
            Page::Market => "Market Radar",
            Page::Roadmap => "Roadmap",
            Page::Pricing => "Pricing",
        }
    }

    pub fn tagline(&self) -> &'static str {
        match self {
            Page::Home => "Describe your startup and launch plan to build a brand strategy.",
            Page::Segment => "Primary market, customer segments and positioning.",
            Page::Target => "Competitors and how you compare.",
            Page::Market => "Audience targeting estimates for launch.",
            Page::Roadmap => "Milestones from idea to first thousand customers.",
            Page::Pricing => "Plans for founders and growing teams.",
        }
    }

    pub fn index(&self) -> usize {
        Page::ALL
            .iter()
            .position(|page| page == self)
            .unwrap_or_default()
    }

    /// Parses a slug, a legacy alias, or a numeric index.
    pub fn parse(raw: &str) -> Option<Page> {
        let value = raw.trim().to_ascii_lowercase();
        if value.is_empty() {
            return None;
        }
        if let Ok(index) = value.parse::<usize>() {
            return Page::ALL.get(index).copied();
        }
        let page = match value.as_str() {
            "home" => Page::Home,
            "segment" | "segmentation" | "branding" => Page::Segment,
            "target" | "target-lens" | "macbook" => Page::Target,
            "market" | "market-radar" | "iphone" => Page::Market,
            "roadmap" | "watch" => Page::Roadmap,
            "pricing" | "airpods" => Page::Pricing,
            _ => return None,
        };
        Some(page)
    }

    /// Like [`Page::parse`] but never fails.
    pub fn resolve(raw: Option<&str>) -> Page {
        raw.and_then(Page::parse).unwrap_or_default()
    }

    /// Pages that display pipeline output.
    pub fn is_report(&self) -> bool {
        matches!(self, Page::Segment | Page::Target | Page::Market)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}
