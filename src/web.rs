use crate::cleanup;
use crate::page::Page;
use crate::pipeline::{Pipeline, PipelineReport, Stage, StageOutput};
use crate::session::{DEFAULT_SESSION_CAPACITY, SessionStore, SubmitOutcome};
use crate::state::{Action, FormSubmission, SessionState, Theme};
use askama::Html as HtmlEscaper;
use askama::{MarkupDisplay, Template};
use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use cookie::{Cookie, SameSite};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::sensitive_headers::{
    SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;
type SafeMarkup = MarkupDisplay<HtmlEscaper, String>;
pub const SESSION_COOKIE: &str = "brandlens_session";
/// Headers that carry the session id; logged as redacted.
const SESSION_HEADERS: [HeaderName; 2] = [header::COOKIE, header::SET_COOKIE];

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub pipeline: Pipeline,
    pub base_url: String,
}

#[derive(Debug, Clone, Copy)]
struct Chrome {
    body_class: &'static str,
    header_class: &'static str,
    brand_class: &'static str,
    nav_class: &'static str,
    nav_active_class: &'static str,
    main_class: &'static str,
    hero_class: &'static str,
    card_class: &'static str,
    eyebrow_class: &'static str,
    headline_class: &'static str,
    lede_class: &'static str,
    muted_class: &'static str,
    error_class: &'static str,
    input_class: &'static str,
    button_class: &'static str,
    link_class: &'static str,
    prose_class: &'static str,
}

impl Chrome {
    fn new(theme: Theme) -> Self {
        match theme {
            Theme::Light => Self {
                body_class: "bg-gradient-to-b from-slate-50 to-white text-slate-900 min-h-screen",
                header_class: "flex flex-wrap items-center justify-between gap-4 px-6 py-4 mx-auto max-w-6xl",
                brand_class: "text-xl font-bold tracking-tight",
                nav_class: "px-3 py-2 rounded-lg bg-white/90 font-semibold shadow-sm hover:-translate-y-0.5 hover:shadow transition",
                nav_active_class: "px-3 py-2 rounded-lg bg-slate-900 text-white font-semibold shadow",
                main_class: "mx-auto max-w-6xl px-6 pb-16 min-h-[640px]",
                hero_class: "rounded-2xl bg-white p-10 shadow-lg space-y-3",
                card_class: "rounded-2xl bg-white/95 p-6 shadow-md",
                eyebrow_class: "uppercase tracking-wide text-sm text-slate-500",
                headline_class: "text-4xl font-extrabold tracking-tight",
                lede_class: "text-lg text-slate-600",
                muted_class: "text-sm text-slate-500",
                error_class: "rounded-lg border border-red-200 bg-red-50 px-4 py-3 text-red-800",
                input_class: "mt-1 w-full rounded-lg border border-slate-300 bg-white p-3",
                button_class: "inline-flex items-center rounded-lg bg-blue-600 px-5 py-2 text-white font-semibold shadow hover:bg-blue-700 disabled:opacity-50 disabled:cursor-not-allowed",
                link_class: "font-bold text-blue-600 hover:underline",
                prose_class: "prose prose-slate max-w-none",
            },
            Theme::Dark => Self {
                body_class: "bg-gradient-to-b from-slate-950 to-slate-900 text-slate-100 min-h-screen",
                header_class: "flex flex-wrap items-center justify-between gap-4 px-6 py-4 mx-auto max-w-6xl",
                brand_class: "text-xl font-bold tracking-tight text-white",
                nav_class: "px-3 py-2 rounded-lg bg-slate-800/90 font-semibold shadow-sm hover:-translate-y-0.5 hover:shadow transition",
                nav_active_class: "px-3 py-2 rounded-lg bg-white text-slate-900 font-semibold shadow",
                main_class: "mx-auto max-w-6xl px-6 pb-16 min-h-[640px]",
                hero_class: "rounded-2xl bg-slate-800 p-10 shadow-lg space-y-3",
                card_class: "rounded-2xl bg-slate-800/90 p-6 shadow-md",
                eyebrow_class: "uppercase tracking-wide text-sm text-slate-400",
                headline_class: "text-4xl font-extrabold tracking-tight text-white",
                lede_class: "text-lg text-slate-300",
                muted_class: "text-sm text-slate-400",
                error_class: "rounded-lg border border-red-800 bg-red-950 px-4 py-3 text-red-200",
                input_class: "mt-1 w-full rounded-lg border border-slate-600 bg-slate-900 p-3 text-slate-100",
                button_class: "inline-flex items-center rounded-lg bg-blue-500 px-5 py-2 text-white font-semibold shadow hover:bg-blue-400 disabled:opacity-50 disabled:cursor-not-allowed",
                link_class: "font-bold text-blue-400 hover:underline",
                prose_class: "prose prose-invert max-w-none",
            },
        }
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub base_url: String,
    pub session_capacity: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            base_url: "http://127.0.0.1:8080".to_string(),
            session_capacity: DEFAULT_SESSION_CAPACITY,
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Io(std::io::Error),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for WebError {}

impl From<std::io::Error> for WebError {
    fn from(value: std::io::Error) -> Self {
        WebError::Io(value)
    }
}

pub async fn serve(config: WebConfig, pipeline: Pipeline) -> Result<(), WebError> {
    let generation = pipeline.is_configured();
    let state = Arc::new(AppState {
        sessions: SessionStore::new(config.session_capacity),
        pipeline,
        base_url: config.base_url.clone(),
    });
    if !generation {
        warn!("no API key configured; report generation is disabled");
    }
    let router = build_router(state);
    info!(
        %config.addr,
        base = %config.base_url,
        sessions = config.session_capacity,
        generation,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    let routes = Router::new()
        .route("/", get(page_html))
        .route("/navigate", post(navigate))
        .route("/theme", post(toggle_theme))
        .route("/generate", post(generate_html))
        .route("/api/session", get(api_session))
        .route("/api/generate", post(api_generate))
        .route("/healthz", get(health))
        .with_state(state);
    with_http_layers(routes)
}

// Response headers are marked inside the trace layer, request headers outside it.
fn with_http_layers(router: Router) -> Router {
    router
        .layer(SetSensitiveResponseHeadersLayer::new(SESSION_HEADERS))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetSensitiveRequestHeadersLayer::new(SESSION_HEADERS))
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// The caller's session, resolved from the cookie header.
struct Visitor {
    id: String,
    state: SessionState,
    is_new: bool,
}

impl Visitor {
    fn load(app: &AppState, headers: &HeaderMap) -> Self {
        let cookie_id = session_cookie(headers);
        let (id, state) = app.sessions.ensure(cookie_id.as_deref());
        let is_new = cookie_id.as_deref() != Some(id.as_str());
        Self { id, state, is_new }
    }

    fn dispatch(&mut self, app: &AppState, action: Action) {
        if let Some(next) = app.sessions.dispatch(&self.id, action) {
            self.state = next;
        }
    }

    fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if self.is_new {
            let cookie = Cookie::build((SESSION_COOKIE, self.id.clone()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(err) => warn!(error = %err, "failed to encode session cookie"),
            }
        }
        response
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NavigateForm {
    page: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateForm {
    #[serde(default)]
    idea: String,
    #[serde(default)]
    launch_plan: String,
}

async fn page_html(
    State(app): State<SharedState>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Response {
    let mut visitor = Visitor::load(&app, &headers);
    if let Some(raw) = params.page.as_deref() {
        visitor.dispatch(&app, Action::Navigate(Page::resolve(Some(raw))));
    }
    let html = render_page(&app, &visitor.state, None, None);
    visitor.respond(Html(html))
}

async fn navigate(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<NavigateForm>,
) -> Response {
    let mut visitor = Visitor::load(&app, &headers);
    visitor.dispatch(&app, Action::Navigate(Page::resolve(form.page.as_deref())));
    visitor.respond(Redirect::to("/"))
}

async fn toggle_theme(State(app): State<SharedState>, headers: HeaderMap) -> Response {
    let mut visitor = Visitor::load(&app, &headers);
    visitor.dispatch(&app, Action::ToggleTheme);
    visitor.respond(Redirect::to("/"))
}

async fn generate_html(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<GenerateForm>,
) -> Response {
    let mut visitor = Visitor::load(&app, &headers);
    let submission = match FormSubmission::new(&form.idea, &form.launch_plan) {
        Ok(submission) => submission,
        Err(err) => {
            let message = err.to_string();
            let html = render_page(&app, &visitor.state, Some(&message), Some(&form));
            return visitor.respond((StatusCode::UNPROCESSABLE_ENTITY, Html(html)));
        }
    };

    let busy = match app.sessions.try_submit(&visitor.id, submission.clone()) {
        Some(SubmitOutcome::Started(state)) => {
            visitor.state = state;
            None
        }
        Some(SubmitOutcome::AlreadyRunning(state)) => {
            visitor.state = state;
            Some("A report is already being generated for this session.")
        }
        None => Some("Your session expired. Please submit the form again."),
    };
    if let Some(message) = busy {
        let html = render_page(&app, &visitor.state, Some(message), Some(&form));
        return visitor.respond((StatusCode::CONFLICT, Html(html)));
    }

    // Detached: stage results reach the session even if the client disconnects.
    let task = {
        let app = Arc::clone(&app);
        let id = visitor.id.clone();
        tokio::spawn(async move {
            let sessions = app.sessions.clone();
            app.pipeline
                .run(&submission, |stage, output| {
                    sessions.dispatch(
                        &id,
                        Action::StageCompleted {
                            stage,
                            output: output.clone(),
                        },
                    );
                })
                .await;
            sessions.dispatch(&id, Action::GenerationFinished);
        })
    };
    if let Err(err) = task.await {
        warn!(error = %err, "generation task did not complete");
        visitor.dispatch(&app, Action::GenerationFinished);
    }
    visitor.respond(Redirect::to("/"))
}

async fn api_session(State(app): State<SharedState>, headers: HeaderMap) -> Response {
    let visitor = Visitor::load(&app, &headers);
    visitor.respond(Json(visitor.state.clone()))
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    idea: String,
    #[serde(default)]
    launch_plan: String,
}

async fn api_generate(
    State(app): State<SharedState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<PipelineReport>, ApiError> {
    let submission = FormSubmission::new(&request.idea, &request.launch_plan)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let report = app.pipeline.run(&submission, |_, _| {}).await;
    Ok(Json(report))
}

async fn health(State(app): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "brandlens-web",
        "generation": app.pipeline.is_configured(),
        "sessions": app.sessions.len(),
    }))
}

struct NavLink {
    slug: &'static str,
    title: &'static str,
    active: bool,
}

struct CardLink {
    slug: &'static str,
    title: &'static str,
    tagline: &'static str,
}

struct Milestone {
    phase: &'static str,
    title: &'static str,
    detail: &'static str,
}

struct Plan {
    name: &'static str,
    price: &'static str,
    features: &'static [&'static str],
    highlighted: bool,
}

const MILESTONES: &[Milestone] = &[
    Milestone {
        phase: "Week 1",
        title: "Segment",
        detail: "Pick the primary market and the segment to win first.",
    },
    Milestone {
        phase: "Week 2",
        title: "Position",
        detail: "Map competitors and write the positioning statement.",
    },
    Milestone {
        phase: "Weeks 3-4",
        title: "Reach",
        detail: "Test two acquisition channels against the audience estimates.",
    },
    Milestone {
        phase: "Month 2",
        title: "Launch",
        detail: "Ship to the first hundred customers and measure retention.",
    },
];

const PLANS: &[Plan] = &[
    Plan {
        name: "Founder",
        price: "Free",
        features: &["One brand strategy per day", "All three reports"],
        highlighted: false,
    },
    Plan {
        name: "Studio",
        price: "$29 / month",
        features: &["Unlimited reports", "Saved sessions", "Priority generation"],
        highlighted: true,
    },
    Plan {
        name: "Agency",
        price: "Contact us",
        features: &["Team workspaces", "Client-ready exports", "Custom prompts"],
        highlighted: false,
    },
];

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en" data-theme="{{ theme }}">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>BrandLens • {{ page.title() }}</title>
    <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
    <link rel="canonical" href="{{ base_url }}/?page={{ page.slug() }}">
  </head>
  <body class="{{ chrome.body_class }}">
    <header class="{{ chrome.header_class }}">
      <div class="{{ chrome.brand_class }}">BrandLens</div>
      <nav class="flex flex-wrap items-center gap-2" aria-label="Primary">
        {% for link in nav %}
        <form method="post" action="/navigate">
          <button type="submit" name="page" value="{{ link.slug }}" class="{% if link.active %}{{ chrome.nav_active_class }}{% else %}{{ chrome.nav_class }}{% endif %}"{% if link.active %} aria-current="page"{% endif %}>{{ link.title }}</button>
        </form>
        {% endfor %}
        <form method="post" action="/theme">
          <button type="submit" class="{{ chrome.nav_class }}">{{ toggle_label }}</button>
        </form>
      </nav>
    </header>
    <main class="{{ chrome.main_class }}">
      {{ body|safe }}
    </main>
    <footer class="mx-auto max-w-6xl px-6 py-4 {{ chrome.muted_class }}">BrandLens v{{ version }}</footer>
  </body>
</html>"#,
    ext = "html"
)]
struct LayoutTemplate<'a> {
    chrome: Chrome,
    theme: Theme,
    page: Page,
    nav: Vec<NavLink>,
    toggle_label: &'static str,
    base_url: &'a str,
    version: &'static str,
    body: String,
}

#[derive(Template)]
#[template(
    source = r#"<section id="page-home" class="space-y-10">
  <div class="{{ chrome.hero_class }}">
    <p class="{{ chrome.eyebrow_class }}">Brand strategy in three steps</p>
    <h1 class="{{ chrome.headline_class }}">Turn a startup idea into a brand strategy.</h1>
    <p class="{{ chrome.lede_class }}">Segmentation, competitive analysis and audience targeting, generated from your idea and launch plan.</p>
  </div>
  <form method="post" action="/generate" class="{{ chrome.card_class }} space-y-4">
    {% if notice.is_some() %}
    <p role="alert" class="{{ chrome.error_class }}">{{ notice.as_ref().unwrap() }}</p>
    {% endif %}
    {% if !generation_enabled %}
    <p class="{{ chrome.muted_class }}">Generation is disabled: no API key is configured.</p>
    {% endif %}
    <label class="block">
      <span class="font-semibold">Startup idea</span>
      <textarea name="idea" rows="3" class="{{ chrome.input_class }}" placeholder="AI tutoring app for high-school students">{{ draft_idea }}</textarea>
    </label>
    <label class="block">
      <span class="font-semibold">Launch plan</span>
      <textarea name="launch_plan" rows="3" class="{{ chrome.input_class }}" placeholder="Launch in Mumbai with ten partner schools">{{ draft_launch_plan }}</textarea>
    </label>
    <button type="submit" class="{{ chrome.button_class }}"{% if !generation_enabled || generating %} disabled{% endif %}>{% if generating %}Generating…{% else %}Generate brand strategy{% endif %}</button>
  </form>
  <div class="grid gap-6 md:grid-cols-3">
    {% for card in cards %}
    <div class="{{ chrome.card_class }}">
      <p class="text-lg font-bold mb-2">{{ card.title }}</p>
      <p class="{{ chrome.muted_class }}">{{ card.tagline }}</p>
      <form method="post" action="/navigate" class="mt-4">
        <button type="submit" name="page" value="{{ card.slug }}" class="{{ chrome.link_class }}">Open →</button>
      </form>
    </div>
    {% endfor %}
  </div>
</section>"#,
    ext = "html"
)]
struct HomeTemplate<'a> {
    chrome: Chrome,
    notice: Option<&'a str>,
    generation_enabled: bool,
    generating: bool,
    draft_idea: &'a str,
    draft_launch_plan: &'a str,
    cards: Vec<CardLink>,
}

#[derive(Template)]
#[template(
    source = r#"<section id="page-{{ page.slug() }}" class="space-y-6">
  <div>
    <p class="{{ chrome.eyebrow_class }}">Step {{ step }} of 3</p>
    <h1 class="{{ chrome.headline_class }}">{{ page.title() }}</h1>
    <p class="{{ chrome.lede_class }}">{{ page.tagline() }}</p>
  </div>
  {% if idea.is_some() %}
  <dl class="{{ chrome.card_class }} grid gap-4 md:grid-cols-2">
    <div>
      <dt class="{{ chrome.muted_class }}">Startup idea</dt>
      <dd class="font-semibold">{{ idea.as_ref().unwrap() }}</dd>
    </div>
    <div>
      <dt class="{{ chrome.muted_class }}">Launch plan</dt>
      <dd class="font-semibold">{{ launch_plan }}</dd>
    </div>
  </dl>
  {% endif %}
  {% if report_html.is_some() %}
  <article class="{{ chrome.card_class }} {{ chrome.prose_class }}">{{ report_html.as_ref().unwrap()|safe }}</article>
  {% else if error.is_some() %}
  <p role="alert" class="{{ chrome.error_class }}">{{ error.as_ref().unwrap() }}</p>
  {% else if generating %}
  <p class="{{ chrome.muted_class }}">Generating… this page fills in when the {{ stage_label }} step finishes.</p>
  {% else %}
  <p class="{{ chrome.muted_class }}">No report yet. Describe your idea on the home page to generate one.</p>
  {% endif %}
</section>"#,
    ext = "html"
)]
struct ReportTemplate<'a> {
    chrome: Chrome,
    page: Page,
    step: usize,
    stage_label: &'static str,
    idea: Option<&'a str>,
    launch_plan: &'a str,
    report_html: Option<String>,
    error: Option<String>,
    generating: bool,
}

#[derive(Template)]
#[template(
    source = r#"<section id="page-roadmap" class="space-y-6">
  <div>
    <h1 class="{{ chrome.headline_class }}">Roadmap</h1>
    <p class="{{ chrome.lede_class }}">{{ tagline }}</p>
  </div>
  <ol class="grid gap-6 md:grid-cols-2">
    {% for milestone in milestones %}
    <li class="{{ chrome.card_class }}">
      <p class="{{ chrome.eyebrow_class }}">{{ milestone.phase }}</p>
      <p class="text-lg font-bold">{{ milestone.title }}</p>
      <p class="{{ chrome.muted_class }}">{{ milestone.detail }}</p>
    </li>
    {% endfor %}
  </ol>
</section>"#,
    ext = "html"
)]
struct RoadmapTemplate {
    chrome: Chrome,
    tagline: &'static str,
    milestones: &'static [Milestone],
}

#[derive(Template)]
#[template(
    source = r#"<section id="page-pricing" class="space-y-6">
  <div>
    <h1 class="{{ chrome.headline_class }}">Pricing</h1>
    <p class="{{ chrome.lede_class }}">{{ tagline }}</p>
  </div>
  <div class="grid gap-6 md:grid-cols-3">
    {% for plan in plans %}
    <div class="{{ chrome.card_class }}{% if plan.highlighted %} ring-2 ring-blue-500{% endif %}">
      <p class="text-lg font-bold">{{ plan.name }}</p>
      <p class="text-3xl font-extrabold my-2">{{ plan.price }}</p>
      <ul class="{{ chrome.muted_class }} space-y-1">
        {% for feature in plan.features %}
        <li>{{ feature }}</li>
        {% endfor %}
      </ul>
    </div>
    {% endfor %}
  </div>
</section>"#,
    ext = "html"
)]
struct PricingTemplate {
    chrome: Chrome,
    tagline: &'static str,
    plans: &'static [Plan],
}

fn render_page(
    app: &AppState,
    state: &SessionState,
    notice: Option<&str>,
    draft: Option<&GenerateForm>,
) -> String {
    let page = state.current_page;
    let chrome = Chrome::new(state.theme);
    let body = render_page_body(app, state, notice, draft)
        .unwrap_or_else(|err| render_error_body(chrome, err.to_string()));
    let nav = Page::ALL
        .iter()
        .map(|link| NavLink {
            slug: link.slug(),
            title: link.title(),
            active: *link == page,
        })
        .collect();
    let layout = LayoutTemplate {
        chrome,
        theme: state.theme,
        page,
        nav,
        toggle_label: match state.theme {
            Theme::Light => "Dark mode",
            Theme::Dark => "Light mode",
        },
        base_url: &app.base_url,
        version: env!("CARGO_PKG_VERSION"),
        body,
    };
    layout
        .render()
        .unwrap_or_else(|err| render_error_page(state.theme, err.to_string()))
}

/// Exactly one body per page.
fn render_page_body(
    app: &AppState,
    state: &SessionState,
    notice: Option<&str>,
    draft: Option<&GenerateForm>,
) -> askama::Result<String> {
    let chrome = Chrome::new(state.theme);
    match state.current_page {
        Page::Home => {
            let (draft_idea, draft_launch_plan) = match draft {
                Some(form) => (form.idea.as_str(), form.launch_plan.as_str()),
                None => (
                    state.startup_idea.as_deref().unwrap_or_default(),
                    state.startup_launch_plan.as_deref().unwrap_or_default(),
                ),
            };
            let cards = Page::ALL
                .iter()
                .filter(|page| **page != Page::Home)
                .map(|page| CardLink {
                    slug: page.slug(),
                    title: page.title(),
                    tagline: page.tagline(),
                })
                .collect();
            HomeTemplate {
                chrome,
                notice,
                generation_enabled: app.pipeline.is_configured(),
                generating: state.generating,
                draft_idea,
                draft_launch_plan,
                cards,
            }
            .render()
        }
        page @ (Page::Segment | Page::Target | Page::Market) => {
            let stage = Stage::for_page(page).unwrap_or(Stage::Segmentation);
            let output = state.output(stage);
            let report_html = output
                .and_then(StageOutput::markdown)
                .and_then(cleanup::render_html);
            let error = output
                .filter(|output| output.is_error())
                .map(StageOutput::display_text);
            ReportTemplate {
                chrome,
                page,
                step: page.index(),
                stage_label: stage.label(),
                idea: state.startup_idea.as_deref(),
                launch_plan: state.startup_launch_plan.as_deref().unwrap_or_default(),
                report_html,
                error,
                generating: state.generating,
            }
            .render()
        }
        Page::Roadmap => RoadmapTemplate {
            chrome,
            tagline: Page::Roadmap.tagline(),
            milestones: MILESTONES,
        }
        .render(),
        Page::Pricing => PricingTemplate {
            chrome,
            tagline: Page::Pricing.tagline(),
            plans: PLANS,
        }
        .render(),
    }
}

fn render_error_body(chrome: Chrome, message: String) -> String {
    format!(
        r#"<section id="page-error" class="{card_class}">
  <h1 class="{headline_class}">Something went wrong</h1>
  <p class="{lede_class}">{message}</p>
</section>"#,
        card_class = chrome.card_class,
        headline_class = chrome.headline_class,
        lede_class = chrome.lede_class,
        message = escaped(message),
    )
}

fn render_error_page(theme: Theme, message: impl Into<String>) -> String {
    let chrome = Chrome::new(theme);
    let message = message.into();
    format!(
        r#"<!DOCTYPE html>
<html lang="en" data-theme="{theme}">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>BrandLens • Error</title>
    <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
  </head>
  <body class="{body_class}">
    <main class="{main_class}">
      <div class="{card_class}">
        <h1 class="{headline_class}">Something went wrong</h1>
        <p class="{lede_class}">{message}</p>
        <a href="/?page=home" class="{button_class}">Back to home</a>
      </div>
    </main>
  </body>
</html>"#,
        theme = theme,
        body_class = chrome.body_class,
        main_class = chrome.main_class,
        card_class = chrome.card_class,
        headline_class = chrome.headline_class,
        lede_class = chrome.lede_class,
        button_class = chrome.button_class,
        message = escaped(message),
    )
}

fn escaped(message: String) -> SafeMarkup {
    MarkupDisplay::new_unsafe(message, HtmlEscaper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::generator::{GenerationError, TextGenerator};
    use crate::pipeline::tests::ScriptedGenerator;
    use async_trait::async_trait;
    use axum::{body, body::Body, http::Request};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            retry_on_rate_limit: true,
            rate_limit_backoff: Duration::ZERO,
        }
    }

    fn test_app(generator: Option<Arc<dyn TextGenerator>>) -> (Router, SharedState) {
        let state = Arc::new(AppState {
            sessions: SessionStore::new(16),
            pipeline: Pipeline::new(generator, fast_config()),
            base_url: "http://127.0.0.1:8080".to_string(),
        });
        (build_router(state.clone()), state)
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn cookie_of(response: &Response) -> String {
        let raw = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap();
        raw.split(';').next().unwrap().to_string()
    }

    fn session_id(cookie: &str) -> String {
        cookie
            .split_once('=')
            .map(|(_, value)| value.to_string())
            .unwrap()
    }

    async fn start_session(router: &Router) -> String {
        let response = send(router, Request::get("/").body(Body::empty()).unwrap()).await;
        assert!(response.status().is_success());
        cookie_of(&response)
    }

    fn form_post(uri: &str, cookie: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::COOKIE, cookie)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn session_state(router: &Router, cookie: &str) -> SessionState {
        let response = send(
            router,
            Request::get("/api/session")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    /// Records what the session looked like at the moment each call arrived.
    struct ProbeGenerator {
        sessions: SessionStore,
        session_id: Mutex<String>,
        observed: Mutex<Vec<(Page, bool)>>,
    }

    #[async_trait]
    impl TextGenerator for ProbeGenerator {
        fn name(&self) -> &str {
            "probe"
        }

        fn model(&self) -> &str {
            "probe-model"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            let id = self.session_id.lock().clone();
            if let Some(state) = self.sessions.snapshot(&id) {
                self.observed
                    .lock()
                    .push((state.current_page, state.generating));
            }
            Ok("## Findings\n\n| Segment | Size |\n|---|---|\n| Students | 2M |".to_string())
        }
    }

    #[tokio::test]
    async fn each_page_renders_only_its_own_body() {
        let (router, _) = test_app(None);
        for page in Page::ALL {
            let response = send(
                &router,
                Request::get(format!("/?page={}", page.slug()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert!(response.status().is_success());
            let html = body_text(response).await;
            assert_eq!(html.matches("<section id=\"page-").count(), 1);
            assert!(html.contains(&format!("<section id=\"page-{}\"", page.slug())));
            for other in Page::ALL.iter().filter(|other| **other != page) {
                assert!(!html.contains(&format!("<section id=\"page-{}\"", other.slug())));
            }
        }
    }

    #[tokio::test]
    async fn unknown_page_falls_back_to_home() {
        let (router, _) = test_app(None);
        let response = send(
            &router,
            Request::get("/?page=settings").body(Body::empty()).unwrap(),
        )
        .await;
        let html = body_text(response).await;
        assert!(html.contains("<section id=\"page-home\""));
    }

    #[tokio::test]
    async fn navigation_persists_in_the_session() {
        let (router, _) = test_app(None);
        let cookie = start_session(&router).await;
        let response = send(&router, form_post("/navigate", &cookie, "page=pricing")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(session_state(&router, &cookie).await.current_page, Page::Pricing);

        let response = send(
            &router,
            Request::get("/")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(body_text(response).await.contains("<section id=\"page-pricing\""));
    }

    #[tokio::test]
    async fn theme_toggle_switches_chrome() {
        let (router, _) = test_app(None);
        let cookie = start_session(&router).await;
        send(&router, form_post("/theme", &cookie, "")).await;
        assert_eq!(session_state(&router, &cookie).await.theme, Theme::Dark);
        let response = send(
            &router,
            Request::get("/")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let html = body_text(response).await;
        assert!(html.contains("data-theme=\"dark\""));
        assert!(html.contains("Light mode"));
    }

    #[tokio::test]
    async fn empty_submission_changes_nothing() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let as_dyn: Arc<dyn TextGenerator> = generator.clone();
        let (router, _) = test_app(Some(as_dyn));
        let cookie = start_session(&router).await;
        let before = session_state(&router, &cookie).await;

        let response = send(
            &router,
            form_post("/generate", &cookie, "idea=AI+tutoring+app&launch_plan=+"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let html = body_text(response).await;
        assert!(html.contains("Please describe your launch plan."));
        assert!(html.contains("AI tutoring app"), "draft input is kept");

        assert_eq!(session_state(&router, &cookie).await, before);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn submission_marks_generating_before_any_call() {
        let probe = Arc::new(ProbeGenerator {
            sessions: SessionStore::new(16),
            session_id: Mutex::new(String::new()),
            observed: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn TextGenerator> = probe.clone();
        let state = Arc::new(AppState {
            sessions: probe.sessions.clone(),
            pipeline: Pipeline::new(Some(as_dyn), fast_config()),
            base_url: "http://127.0.0.1:8080".to_string(),
        });
        let router = build_router(state);

        let cookie = start_session(&router).await;
        *probe.session_id.lock() = session_id(&cookie);

        let response = send(
            &router,
            form_post(
                "/generate",
                &cookie,
                "idea=AI+tutoring+app&launch_plan=Launch+in+Mumbai",
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let observed = probe.observed.lock().clone();
        assert_eq!(observed.len(), 3);
        assert!(observed.iter().all(|seen| *seen == (Page::Segment, true)));

        let state = session_state(&router, &cookie).await;
        assert!(!state.generating);
        assert_eq!(state.current_page, Page::Segment);
        assert_eq!(state.startup_idea.as_deref(), Some("AI tutoring app"));
        for stage in Stage::ALL {
            assert!(!state.output(stage).unwrap().is_error());
        }

        let response = send(
            &router,
            Request::get("/?page=market")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let html = body_text(response).await;
        assert!(html.contains("<table>"), "report markdown renders as HTML");
        assert!(html.contains("Launch in Mumbai"));
    }

    #[tokio::test]
    async fn first_stage_failure_fills_dependents() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(GenerationError::Request(
            "HTTP 403: key revoked".into(),
        ))]));
        let as_dyn: Arc<dyn TextGenerator> = generator.clone();
        let (router, _) = test_app(Some(as_dyn));
        let cookie = start_session(&router).await;
        send(
            &router,
            form_post("/generate", &cookie, "idea=idea&launch_plan=plan"),
        )
        .await;

        assert_eq!(generator.calls(), 1);
        let state = session_state(&router, &cookie).await;
        let segmentation = state.segmentation_output.unwrap();
        assert!(segmentation.display_text().starts_with("Error:"));
        let dependent = StageOutput::failed(&GenerationError::DependencyFailed {
            upstream: Stage::Segmentation.label(),
        });
        assert_eq!(state.target_lens_output.as_ref(), Some(&dependent));
        assert_eq!(state.market_radar_output.as_ref(), Some(&dependent));

        let response = send(
            &router,
            Request::get("/?page=target")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let html = body_text(response).await;
        assert!(html.contains("previous stage produced no usable output"));
    }

    #[tokio::test]
    async fn unconfigured_generation_is_disabled() {
        let (router, _) = test_app(None);
        let response = send(&router, Request::get("/").body(Body::empty()).unwrap()).await;
        let html = body_text(response).await;
        assert!(html.contains("Generation is disabled"));
        assert!(html.contains(" disabled>"));

        let response = send(&router, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        let payload: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["generation"], false);
    }

    #[tokio::test]
    async fn api_generate_returns_report() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("one".into()),
            Ok("two".into()),
            Ok("three".into()),
        ]));
        let as_dyn: Arc<dyn TextGenerator> = generator.clone();
        let (router, _) = test_app(Some(as_dyn));
        let response = send(
            &router,
            Request::post("/api/generate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"idea":"AI tutoring app","launch_plan":"Launch in Mumbai"}"#,
                ))
                .unwrap(),
        )
        .await;
        assert!(response.status().is_success());
        let report: PipelineReport = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(report.succeeded());
        assert_eq!(report.market_radar.markdown(), Some("three"));
    }

    #[tokio::test]
    async fn api_generate_rejects_empty_fields() {
        let (router, _) = test_app(None);
        let response = send(
            &router,
            Request::post("/api/generate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"idea":"","launch_plan":""}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("both"));
    }

    #[tokio::test]
    async fn submission_while_generating_is_rejected() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let as_dyn: Arc<dyn TextGenerator> = generator.clone();
        let (router, app) = test_app(Some(as_dyn));
        let cookie = start_session(&router).await;
        let id = session_id(&cookie);
        let submission = FormSubmission::new("first idea", "first plan").unwrap();
        assert!(matches!(
            app.sessions.try_submit(&id, submission),
            Some(SubmitOutcome::Started(_))
        ));

        let response = send(
            &router,
            form_post("/generate", &cookie, "idea=second+idea&launch_plan=second+plan"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains("already being generated"));
        assert_eq!(generator.calls(), 0);

        let state = session_state(&router, &cookie).await;
        assert!(state.generating);
        assert_eq!(state.startup_idea.as_deref(), Some("first idea"));
    }

    #[tokio::test]
    async fn session_headers_are_redacted_for_tracing() {
        async fn echo(headers: HeaderMap) -> Response {
            let request_redacted = headers
                .get(header::COOKIE)
                .is_some_and(HeaderValue::is_sensitive);
            let mut response = request_redacted.to_string().into_response();
            response.headers_mut().insert(
                header::SET_COOKIE,
                HeaderValue::from_static("brandlens_session=abc; Path=/"),
            );
            response
        }

        let router = with_http_layers(Router::new().route("/echo", get(echo)));
        let response = send(
            &router,
            Request::get("/echo")
                .header(header::COOKIE, "brandlens_session=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(response.headers()[header::SET_COOKIE].is_sensitive());
        assert_eq!(body_text(response).await, "true");
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; brandlens_session=abc; other=1"),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc"));
        assert!(session_cookie(&HeaderMap::new()).is_none());
    }

    #[test]
    fn error_body_escapes_message() {
        let html = render_error_body(Chrome::new(Theme::Light), "<script>".to_string());
        assert!(html.contains("&lt;script&gt;"));
    }
}
