//! # PerlMonks Code Tidier (pmtidy)
//!
//! A CLI tool that finds the code blocks of a saved PerlMonks page, asks a
//! remote perltidy service for highlighted and tidied renderings, and lets
//! each block be toggled between its plain, highlighted and tidied forms.
//!
//! ## Overview
//!
//! `pmtidy` never formats code itself. Highlighting and reformatting happen on
//! the remote service; this tool locates the blocks, ships their contents out,
//! caches the two renderings that come back and swaps the visible markup on
//! demand. The result is the same page with a token style sheet injected and a
//! row of `[plain] [hilite] [tidy]` toggles under every code block.
//!
//! ## Key Components
//!
//! - **Block Locator**: walks the ancestor chain of each `<tt class="codetext">`
//!   leaf up to its `<p class="code">` / `<pre class="code">` container.
//! - **Formatting Client**: encodes one request per block, sends it on a worker
//!   thread and decodes the reply with a pluggable [`Framing`].
//! - **Display Controller**: per-block state machine over the three renderings;
//!   errors freeze a block for good.
//! - **Registry**: ordered collection of controllers with the three batch
//!   commands (revert, highlight all, tidy all) and per-block dispatch.
//!
//! ## Flow
//!
//! ```text
//! Input → Parse → Inject styles → Locate blocks → Fetch renderings → Batch command → Output
//!                                       ↓                ↓
//!                                 rejected leaves   completions arrive
//!                                 are skipped       in any order
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (file not found, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Strict mode: at least one block ended in an error state |
//! | 4 | Parse error (invalid UTF-8 or binary input) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use html5ever::driver::{ParseOpts, parse_document, parse_fragment};
use html5ever::serialize::{SerializeOpts, TraversalScope, serialize};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{Attribute, LocalName, Namespace, QualName};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom, SerializableHandle};
use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use ureq::Agent;
use ureq::tls::{RootCerts, TlsConfig, TlsProvider};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Strict mode: one or more blocks ended in an error state
    pub const BLOCK_ERRORS: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
struct RunOutcome {
    strict: bool,
    block_errors: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display States
// ─────────────────────────────────────────────────────────────────────────────

/// Placeholder shown for a rendering that has not arrived yet
const PLACEHOLDER: &str = "Loading...";

/// Identity of a code block: its index in the registry
type BlockId = usize;

/// One of the three renderings a code block can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum View {
    /// The page's own markup
    Plain,
    /// Lexically highlighted markup from the service
    Hilite,
    /// Reformatted (perltidy) markup from the service
    Tidy,
}

impl View {
    const ALL: [View; 3] = [View::Plain, View::Hilite, View::Tidy];

    fn label(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Hilite => "hilite",
            Self::Tidy => "tidy",
        }
    }
}

/// Why a block stopped accepting display changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// The service refused the code (not valid Perl)
    Syntax,
    /// Non-200 reply, unreachable service, or an incomplete payload
    Transport,
}

impl Failure {
    fn label(self) -> &'static str {
        match self {
            Self::Syntax => "skipped",
            Self::Transport => "cgi error",
        }
    }
}

/// Status of a code block. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Showing(View),
    Failed(Failure),
}

impl Status {
    fn name(self) -> &'static str {
        match self {
            Self::Showing(View::Plain) => "original",
            Self::Showing(View::Hilite) => "highlighted",
            Self::Showing(View::Tidy) => "tidied",
            Self::Failed(Failure::Syntax) => "error_syntax",
            Self::Failed(Failure::Transport) => "error_transport",
        }
    }
}

/// The two renderings produced by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Renderings {
    highlighted: String,
    tidied: String,
}

/// A control under a code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affordance {
    /// Clickable link switching to another view
    Toggle(View),
    /// The view currently shown, rendered inert
    Active(View),
    /// Inert error label replacing all toggles
    Notice(Failure),
}

impl Affordance {
    fn text(self) -> String {
        let label = match self {
            Self::Toggle(view) | Self::Active(view) => view.label(),
            Self::Notice(failure) => failure.label(),
        };
        format!("[{}]", label)
    }
}

/// The display state machine of a single code block, independent of the DOM.
///
/// ```text
/// Plain ⇄ Hilite ⇄ Tidy          (any to any via set_display)
///   └──────┴────────┴──→ Failed  (only from a fetch completion; terminal)
/// ```
#[derive(Debug, Clone)]
struct DisplayState {
    original: String,
    derived: Option<Renderings>,
    status: Status,
    /// Rendering currently in the visible body. Differs from `status` only
    /// after a failure.
    visible: View,
}

impl DisplayState {
    fn new(original: String) -> Self {
        Self {
            original,
            derived: None,
            status: Status::Showing(View::Plain),
            visible: View::Plain,
        }
    }

    fn status(&self) -> Status {
        self.status
    }

    fn is_frozen(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }

    fn is_resolved(&self) -> bool {
        self.derived.is_some() || self.is_frozen()
    }

    fn visible(&self) -> View {
        self.visible
    }

    fn text_for(&self, view: View) -> &str {
        match (view, &self.derived) {
            (View::Plain, _) => &self.original,
            (View::Hilite, Some(r)) => &r.highlighted,
            (View::Tidy, Some(r)) => &r.tidied,
            (_, None) => PLACEHOLDER,
        }
    }

    /// Markup for the visible body
    fn body(&self) -> &str {
        self.text_for(self.visible)
    }

    fn shows_placeholder(&self) -> bool {
        self.visible != View::Plain && self.derived.is_none()
    }

    /// Switch to `target`. Returns false (and changes nothing) once frozen.
    fn set_display(&mut self, target: View) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.status = Status::Showing(target);
        self.visible = target;
        true
    }

    /// Apply a fetch completion. Returns true when the visible body changed.
    fn resolve(&mut self, outcome: std::result::Result<Renderings, Failure>) -> bool {
        if self.is_resolved() {
            return false;
        }
        let was_placeholder = self.shows_placeholder();
        match outcome {
            Ok(renderings) => {
                self.derived = Some(renderings);
            }
            Err(failure) => {
                self.status = Status::Failed(failure);
                if was_placeholder {
                    self.visible = View::Plain;
                }
            }
        }
        was_placeholder
    }

    fn affordances(&self) -> Vec<Affordance> {
        match self.status {
            Status::Failed(failure) => vec![Affordance::Notice(failure)],
            Status::Showing(current) => View::ALL
                .iter()
                .map(|&view| {
                    if view == current {
                        Affordance::Active(view)
                    } else {
                        Affordance::Toggle(view)
                    }
                })
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DOM Helpers
// ─────────────────────────────────────────────────────────────────────────────

const HTML_NS: &str = "http://www.w3.org/1999/xhtml";

fn html_name(tag: &str) -> QualName {
    QualName::new(None, Namespace::from(HTML_NS), LocalName::from(tag))
}

fn tag_name(node: &Node) -> Option<&str> {
    match &node.data {
        NodeData::Element { name, .. } => Some(&*name.local),
        _ => None,
    }
}

fn attr(node: &Node, key: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|a| &*a.name.local == key)
            .map(|a| a.value.to_string()),
        _ => None,
    }
}

fn parent_of(node: &Handle) -> Option<Handle> {
    let weak = node.parent.take()?;
    let parent = weak.upgrade();
    node.parent.set(Some(weak));
    parent
}

fn ancestors(node: &Handle) -> impl Iterator<Item = Handle> {
    std::iter::successors(parent_of(node), parent_of)
}

/// All descendants of `node` in document order, `node` itself excluded
fn descendants(node: &Handle) -> Vec<Handle> {
    let mut out = Vec::new();
    let mut stack: Vec<Handle> = node.children.borrow().iter().rev().cloned().collect();
    while let Some(next) = stack.pop() {
        stack.extend(next.children.borrow().iter().rev().cloned());
        out.push(next);
    }
    out
}

fn elements_by_tag(node: &Handle, tag: &str) -> Vec<Handle> {
    descendants(node)
        .into_iter()
        .filter(|n| tag_name(n) == Some(tag))
        .collect()
}

fn append_child(parent: &Handle, child: Handle) {
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child);
}

fn detach_child(parent: &Handle, child: &Handle) {
    parent
        .children
        .borrow_mut()
        .retain(|c| !Rc::ptr_eq(c, child));
    child.parent.set(None);
}

fn new_element(tag: &str, attrs: &[(&str, &str)]) -> Handle {
    let attrs = attrs
        .iter()
        .map(|(key, value)| Attribute {
            name: QualName::new(None, Namespace::from(""), LocalName::from(*key)),
            value: StrTendril::from_slice(value),
        })
        .collect();
    Node::new(NodeData::Element {
        name: html_name(tag),
        attrs: RefCell::new(attrs),
        template_contents: RefCell::new(None),
        mathml_annotation_xml_integration_point: false,
    })
}

fn new_text(text: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(StrTendril::from_slice(text)),
    })
}

fn serialize_node(node: &Handle) -> Result<String> {
    let mut out = Vec::new();
    let opts = SerializeOpts {
        traversal_scope: TraversalScope::ChildrenOnly(None),
        ..Default::default()
    };
    serialize(&mut out, &SerializableHandle::from(node.clone()), opts)
        .context("Failed to serialize markup")?;
    String::from_utf8(out).context("Serialized markup is not valid UTF-8")
}

/// Parse `html` as the content of a `context` element, returning detached nodes
fn parse_fragment_nodes(html: &str, context: &str) -> Vec<Handle> {
    let dom = parse_fragment(
        RcDom::default(),
        ParseOpts::default(),
        html_name(context),
        Vec::new(),
    )
    .one(html);
    let root = dom.document.children.borrow().first().cloned();
    let Some(root) = root else {
        return Vec::new();
    };
    let nodes: Vec<Handle> = root.children.borrow_mut().drain(..).collect();
    for node in &nodes {
        node.parent.set(None);
    }
    nodes
}

fn set_inner_html(node: &Handle, html: &str) {
    let context = tag_name(node).unwrap_or("div").to_string();
    let old: Vec<Handle> = node.children.borrow_mut().drain(..).collect();
    for child in &old {
        child.parent.set(None);
    }
    for child in parse_fragment_nodes(html, &context) {
        append_child(node, child);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page
// ─────────────────────────────────────────────────────────────────────────────

/// Tag of a code leaf
const LEAF_TAG: &str = "tt";
/// Class of a code leaf
const LEAF_CLASS: &str = "codetext";
/// Class of the `<div>`/`<span>` wrapper between leaf and container
const WRAPPER_CLASS: &str = "codeblock";
/// Class of the `<p>`/`<pre>` container
const CONTAINER_CLASS: &str = "code";
/// Class of the row holding the `[download]` link and our toggles
const LINK_ROW_CLASS: &str = "embed-code-dl";

/// Id of the injected style element
const STYLE_ELEMENT_ID: &str = "pmtidy-style";

/// perltidy token classes, as emitted by the service's HTML formatter
const TOKEN_STYLES: &str = "
.c  { color: #228B22;} /* comment */
.cm { color: #000000;} /* comma */
.co { color: #000000;} /* colon */
.h  { color: #CD5555; font-weight:bold;} /* here-doc-target */
.hh { color: #CD5555; font-style:italic;} /* here-doc-text */
.i  { color: #00688B;} /* identifier */
.j  { color: #CD5555; font-weight:bold;} /* label */
.k  { color: #8B008B; font-weight:bold;} /* keyword */
.m  { color: #FF0000; font-weight:bold;} /* subroutine */
.n  { color: #B452CD;} /* numeric */
.p  { color: #000000;} /* paren */
.pd { color: #228B22; font-style:italic;} /* pod-text */
.pu { color: #000000;} /* punctuation */
.q  { color: #CD5555;} /* quote */
.s  { color: #000000;} /* structure */
.sc { color: #000000;} /* semicolon */
.v  { color: #B452CD;} /* v-string */
.w  { color: #000000;} /* bareword */
.embed-code-dl span { font-size: smaller; }
";

/// A parsed HTML document.
struct Page {
    dom: RcDom,
}

impl Page {
    fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        Self { dom }
    }

    /// Candidate code leaves in reverse document order
    fn code_leaves(&self) -> Vec<Handle> {
        let mut leaves: Vec<Handle> = descendants(&self.dom.document)
            .into_iter()
            .filter(|n| {
                tag_name(n) == Some(LEAF_TAG) && attr(n, "class").as_deref() == Some(LEAF_CLASS)
            })
            .collect();
        leaves.reverse();
        leaves
    }

    /// Append the token style sheet to `<head>`. Returns false when the page
    /// already carries it or has no head.
    fn inject_style(&self) -> bool {
        let all = descendants(&self.dom.document);
        if all
            .iter()
            .any(|n| attr(n, "id").as_deref() == Some(STYLE_ELEMENT_ID))
        {
            return false;
        }
        let Some(head) = all.iter().find(|n| tag_name(n) == Some("head")) else {
            return false;
        };
        let style = new_element("style", &[("type", "text/css"), ("id", STYLE_ELEMENT_ID)]);
        append_child(&style, new_text(TOKEN_STYLES));
        append_child(head, style);
        true
    }

    fn to_html(&self) -> Result<String> {
        serialize_node(&self.dom.document)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Locator
// ─────────────────────────────────────────────────────────────────────────────

/// Why a code leaf was not turned into a block.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LocateError {
    /// A `<div>`/`<span>` ancestor without the wrapper class
    WrapperClass { tag: String, class: String },
    /// A `<p>`/`<pre>` ancestor without the container class
    ContainerClass { tag: String, class: String },
    /// An ancestor tag outside the expected vocabulary
    UnknownAncestor(String),
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrapperClass { tag, class } => write!(
                f,
                "enclosing {} tag has class '{}', expected '{}'",
                tag, class, WRAPPER_CLASS
            ),
            Self::ContainerClass { tag, class } => write!(
                f,
                "enclosing {} tag has class '{}', expected '{}'",
                tag, class, CONTAINER_CLASS
            ),
            Self::UnknownAncestor(tag) => write!(f, "unknown {} tag encloses the code text", tag),
        }
    }
}

/// Outcome of classifying one ancestor of a code leaf
enum AncestorStep {
    Skip,
    Wrapper(Handle),
    Container(Handle),
    Reject(LocateError),
}

fn classify_ancestor(node: &Handle) -> AncestorStep {
    let Some(tag) = tag_name(node) else {
        return AncestorStep::Reject(LocateError::UnknownAncestor("#document".to_string()));
    };
    let class = attr(node, "class").unwrap_or_default();
    match tag {
        "font" => AncestorStep::Skip,
        "div" | "span" if class == WRAPPER_CLASS => AncestorStep::Wrapper(node.clone()),
        "div" | "span" => AncestorStep::Reject(LocateError::WrapperClass {
            tag: tag.to_uppercase(),
            class,
        }),
        "p" | "pre" if class == CONTAINER_CLASS => AncestorStep::Container(node.clone()),
        "p" | "pre" => AncestorStep::Reject(LocateError::ContainerClass {
            tag: tag.to_uppercase(),
            class,
        }),
        other => AncestorStep::Reject(LocateError::UnknownAncestor(other.to_uppercase())),
    }
}

/// Where a located block lives in the page.
struct BlockSite {
    leaf: Handle,
    container: Handle,
    /// Existing `[download]` row, if the page has one for this block
    links: Option<Handle>,
}

/// The download row is the second element of the wrapper's tag under the
/// wrapper's parent; the first is the wrapper itself.
fn link_row_for(wrapper: &Handle) -> Option<Handle> {
    let tag = tag_name(wrapper)?.to_string();
    let parent = parent_of(wrapper)?;
    elements_by_tag(&parent, &tag).into_iter().nth(1)
}

/// Walk the ancestors of `leaf` up to its code container.
///
/// The first ancestor outside the expected vocabulary aborts the walk.
fn locate_block(leaf: &Handle) -> std::result::Result<BlockSite, LocateError> {
    let mut links = None;
    for node in ancestors(leaf) {
        match classify_ancestor(&node) {
            AncestorStep::Skip => {}
            AncestorStep::Wrapper(wrapper) => links = link_row_for(&wrapper),
            AncestorStep::Container(container) => {
                return Ok(BlockSite {
                    leaf: leaf.clone(),
                    container,
                    links,
                });
            }
            AncestorStep::Reject(reason) => return Err(reason),
        }
    }
    Err(LocateError::UnknownAncestor("#document".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Display Controller
// ─────────────────────────────────────────────────────────────────────────────

/// A request for one block's renderings, ready for a [`Framing`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct FormatJob {
    id: BlockId,
    /// Inner HTML of the code element
    code: String,
    /// Container tag name, uppercase (`P` or `PRE`)
    tag: String,
}

/// A located code block bound to its place in the page.
struct CodeBlock {
    id: BlockId,
    tag: String,
    /// Element whose children are swapped between renderings
    code: Handle,
    /// Row receiving the toggle affordances
    links: Handle,
    /// Affordance nodes currently in `links`
    shown: Vec<Handle>,
    state: DisplayState,
}

impl CodeBlock {
    fn attach(id: BlockId, site: BlockSite) -> Result<Self> {
        // Code can sit inside a <font size="-1"> within the <tt>
        let code = elements_by_tag(&site.leaf, "font")
            .into_iter()
            .next()
            .unwrap_or_else(|| site.leaf.clone());
        let original = inner_html_of(&code)?;
        let links = match site.links {
            Some(row) => row,
            None => create_link_row(&site.container, tag_name(&code) == Some("font")),
        };
        let tag = tag_name(&site.container)
            .unwrap_or_default()
            .to_uppercase();

        let mut block = Self {
            id,
            tag,
            code,
            links,
            shown: Vec::new(),
            state: DisplayState::new(original),
        };
        block.render_affordances();
        Ok(block)
    }

    fn status(&self) -> Status {
        self.state.status()
    }

    fn job(&self) -> FormatJob {
        FormatJob {
            id: self.id,
            code: self.state.original.clone(),
            tag: self.tag.clone(),
        }
    }

    fn set_display(&mut self, target: View) {
        if !self.state.set_display(target) {
            return;
        }
        self.render_body();
        self.render_affordances();
    }

    fn resolve(&mut self, outcome: std::result::Result<Renderings, Failure>) {
        if self.state.is_resolved() {
            return;
        }
        if self.state.resolve(outcome) {
            self.render_body();
        }
        self.render_affordances();
    }

    fn render_body(&self) {
        set_inner_html(&self.code, self.state.body());
    }

    /// Drop every affordance we added and build the set for the current state
    fn render_affordances(&mut self) {
        for node in self.shown.drain(..) {
            detach_child(&self.links, &node);
        }
        for affordance in self.state.affordances() {
            let node = affordance_node(self.id, affordance);
            append_child(&self.links, node.clone());
            self.shown.push(node);
        }
    }
}

fn inner_html_of(node: &Handle) -> Result<String> {
    serialize_node(node)
}

/// Create the row for a block that has no `[download]` link of its own
fn create_link_row(container: &Handle, in_font: bool) -> Handle {
    let row = new_element("div", &[("class", LINK_ROW_CLASS)]);
    if in_font {
        // Match the font size of real download rows
        let font = new_element("font", &[("size", "-1")]);
        append_child(&font, row.clone());
        append_child(container, font);
    } else {
        append_child(container, row.clone());
    }
    row
}

fn affordance_node(id: BlockId, affordance: Affordance) -> Handle {
    let node = match affordance {
        Affordance::Toggle(view) => {
            let id = id.to_string();
            new_element(
                "a",
                &[
                    ("href", "javascript:void(0);"),
                    ("data-pmtidy-block", id.as_str()),
                    ("data-pmtidy-view", view.label()),
                ],
            )
        }
        Affordance::Active(_) | Affordance::Notice(_) => new_element("span", &[]),
    };
    append_child(&node, new_text(&affordance.text()));
    node
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Page-level batch commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MenuCommand {
    /// Revert all code
    Revert,
    /// Highlight all code
    Highlight,
    /// Tidy all code
    Tidy,
}

impl MenuCommand {
    fn view(self) -> View {
        match self {
            Self::Revert => View::Plain,
            Self::Highlight => View::Hilite,
            Self::Tidy => View::Tidy,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Revert => "Revert all code",
            Self::Highlight => "Highlight all code",
            Self::Tidy => "Tidy all code",
        }
    }
}

/// Ordered, append-only collection of the page's code blocks.
struct Registry {
    blocks: Vec<CodeBlock>,
    rejected: Vec<LocateError>,
    leaves_found: usize,
}

impl Registry {
    /// Scan the page once and attach a controller to every leaf that locates.
    fn build(page: &Page) -> Result<Self> {
        let leaves = page.code_leaves();
        let mut blocks = Vec::new();
        let mut rejected = Vec::new();

        for leaf in &leaves {
            match locate_block(leaf) {
                Ok(site) => {
                    let id = blocks.len();
                    blocks.push(CodeBlock::attach(id, site)?);
                }
                Err(reason) => rejected.push(reason),
            }
        }

        Ok(Self {
            blocks,
            rejected,
            leaves_found: leaves.len(),
        })
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    fn jobs(&self) -> Vec<FormatJob> {
        self.blocks.iter().map(CodeBlock::job).collect()
    }

    /// Revert, highlight or tidy every block. Frozen blocks stay as they are.
    fn run_command(&mut self, command: MenuCommand) {
        let view = command.view();
        for block in &mut self.blocks {
            block.set_display(view);
        }
    }

    /// Per-block toggle handler
    fn dispatch(&mut self, id: BlockId, view: View) -> Result<()> {
        let count = self.blocks.len();
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| ArgError(format!("No code block #{} (page has {})", id, count)))?;
        block.set_display(view);
        Ok(())
    }

    /// Route a fetch completion to its block. Returns false for unknown ids.
    fn resolve(&mut self, id: BlockId, outcome: std::result::Result<Renderings, Failure>) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) => {
                block.resolve(outcome);
                true
            }
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting Service: Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Wire body ready to POST.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EncodedRequest {
    content_type: &'static str,
    body: String,
}

/// What a 200 reply body says.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServiceReply {
    Formatted(Renderings),
    Rejected(String),
    Malformed(String),
}

/// Request/response framing of the formatting service.
trait Framing {
    fn encode(&self, job: &FormatJob) -> EncodedRequest;
    fn decode(&self, body: &str) -> ServiceReply;
}

/// Framing selector for configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FramingKind {
    /// Form-encoded request, `<div id=..>` delimited reply (service 1.3)
    Delimited,
    /// `<tidyreq>` request, `<tidyresp>` reply with CDATA sections
    Xml,
}

/// Markers of the delimited framing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct DelimitedConfig {
    /// Whole-body reply meaning "not Perl"
    sentinel: String,
    /// `id` of the div holding the highlighted rendering
    highlight_id: String,
    /// `id` of the div holding the tidied rendering
    tidy_id: String,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            sentinel: "How very unperlish of you!".to_string(),
            highlight_id: "highlight".to_string(),
            tidy_id: "tidy".to_string(),
        }
    }
}

struct DelimitedFraming {
    markers: DelimitedConfig,
}

impl DelimitedFraming {
    fn new(markers: DelimitedConfig) -> Self {
        Self { markers }
    }
}

/// Text between `<div id="{id}">` and the next `</div>`
fn extract_section<'a>(body: &'a str, id: &str) -> Option<&'a str> {
    let open = format!("<div id=\"{}\">", id);
    let start = body.find(&open)? + open.len();
    let rest = &body[start..];
    let end = rest.find("</div>")?;
    Some(&rest[..end])
}

impl Framing for DelimitedFraming {
    fn encode(&self, job: &FormatJob) -> EncodedRequest {
        // The service unescapes the code field twice
        let escaped = job.code.replace('%', "%25");
        EncodedRequest {
            content_type: "application/x-www-form-urlencoded; charset=UTF-8",
            body: format!("code={};tag={}", urlencoding::encode(&escaped), job.tag),
        }
    }

    fn decode(&self, body: &str) -> ServiceReply {
        if body == self.markers.sentinel {
            return ServiceReply::Rejected(body.to_string());
        }
        let highlighted = extract_section(body, &self.markers.highlight_id);
        let tidied = extract_section(body, &self.markers.tidy_id);
        match (highlighted, tidied) {
            (Some(h), Some(t)) if !h.is_empty() && !t.is_empty() => {
                ServiceReply::Formatted(Renderings {
                    highlighted: h.to_string(),
                    tidied: t.to_string(),
                })
            }
            _ => ServiceReply::Malformed(format!(
                "reply lacks '{}' or '{}' section",
                self.markers.highlight_id, self.markers.tidy_id
            )),
        }
    }
}

struct XmlFraming;

impl Framing for XmlFraming {
    fn encode(&self, job: &FormatJob) -> EncodedRequest {
        let code = job.code.replace("]]>", "]]]]><![CDATA[>");
        EncodedRequest {
            content_type: "text/xml; charset=UTF-8",
            body: format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <tidyreq><code><![CDATA[{}]]></code><tag>{}</tag></tidyreq>",
                code, job.tag
            ),
        }
    }

    fn decode(&self, body: &str) -> ServiceReply {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut root_seen = false;
        let mut first_child: Option<String> = None;
        let mut hilited: Option<String> = None;
        let mut tidied: Option<String> = None;
        let mut error_text = String::new();

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(err) => {
                    return ServiceReply::Malformed(format!(
                        "invalid XML at byte {}: {}",
                        reader.buffer_position(),
                        err
                    ));
                }
            };
            match event {
                XmlEvent::Start(ref e) | XmlEvent::Empty(ref e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if stack.is_empty() {
                        if root_seen || name != "tidyresp" {
                            return ServiceReply::Malformed(format!(
                                "unexpected root element <{}>",
                                name
                            ));
                        }
                        root_seen = true;
                    } else if stack.len() == 1 && first_child.is_none() {
                        first_child = Some(name.clone());
                    }
                    if matches!(event, XmlEvent::Start(_)) {
                        stack.push(name);
                    }
                }
                XmlEvent::End(_) => {
                    stack.pop();
                }
                XmlEvent::CData(cdata) => {
                    let text = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                    match stack.last().map(String::as_str) {
                        // Adjacent sections carry a split "]]>"
                        Some("hilited") => hilited.get_or_insert_with(String::new).push_str(&text),
                        Some("tidied") => tidied.get_or_insert_with(String::new).push_str(&text),
                        Some("error") => error_text.push_str(&text),
                        _ => {}
                    }
                }
                XmlEvent::Text(text) => {
                    if stack.last().map(String::as_str) == Some("error") {
                        let text = text
                            .unescape()
                            .map(|t| t.into_owned())
                            .unwrap_or_default();
                        error_text.push_str(&text);
                    }
                }
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        if !root_seen {
            return ServiceReply::Malformed("empty reply".to_string());
        }
        if first_child.as_deref() == Some("error") {
            return ServiceReply::Rejected(error_text.trim().to_string());
        }
        match (hilited, tidied) {
            (Some(h), Some(t)) if !h.is_empty() && !t.is_empty() => {
                ServiceReply::Formatted(Renderings {
                    highlighted: h,
                    tidied: t,
                })
            }
            _ => ServiceReply::Malformed("reply lacks hilited or tidied CDATA".to_string()),
        }
    }
}

fn build_framing(config: &Config) -> Box<dyn Framing> {
    match config.framing {
        FramingKind::Delimited => Box::new(DelimitedFraming::new(config.delimited.clone())),
        FramingKind::Xml => Box::new(XmlFraming),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting Service: Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Raw HTTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct HttpReply {
    status: u16,
    body: String,
}

/// The request never produced a reply (DNS, refused, timeout, bad body)
#[derive(Debug, Clone, PartialEq, Eq)]
struct TransportError(String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Sends one encoded request. Called from worker threads.
trait Transport: Send + Sync {
    fn post(&self, request: &EncodedRequest) -> std::result::Result<HttpReply, TransportError>;
}

struct HttpTransport {
    agent: Agent,
    endpoint: String,
    user_agent: String,
}

impl HttpTransport {
    fn new(config: &Config) -> Self {
        let tls_config = TlsConfig::builder()
            .provider(TlsProvider::NativeTls)
            .root_certs(RootCerts::PlatformVerifier)
            .build();

        let agent: Agent = Agent::config_builder()
            .tls_config(tls_config)
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            endpoint: config.endpoint.clone(),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, request: &EncodedRequest) -> std::result::Result<HttpReply, TransportError> {
        let mut response = self
            .agent
            .post(&self.endpoint)
            .header("User-Agent", self.user_agent.as_str())
            .header("Content-Type", request.content_type)
            .send(request.body.as_str())
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportError(format!("failed to read reply body: {}", e)))?;

        Ok(HttpReply { status, body })
    }
}

/// A failed fetch, with enough detail to log.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchFailure {
    Connection(String),
    Status(u16),
    Malformed(String),
    Rejected(String),
}

impl FetchFailure {
    fn kind(&self) -> Failure {
        match self {
            Self::Rejected(_) => Failure::Syntax,
            Self::Connection(_) | Self::Status(_) | Self::Malformed(_) => Failure::Transport,
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "request failed: {}", msg),
            Self::Status(status) => write!(f, "service answered HTTP {}", status),
            Self::Malformed(msg) => write!(f, "malformed reply: {}", msg),
            Self::Rejected(msg) if msg.is_empty() => write!(f, "service rejected the code"),
            Self::Rejected(msg) => write!(f, "service rejected the code: {}", msg),
        }
    }
}

/// Turn a raw completion into renderings or a failure
fn interpret(
    result: std::result::Result<HttpReply, TransportError>,
    framing: &dyn Framing,
) -> std::result::Result<Renderings, FetchFailure> {
    let reply = result.map_err(|e| FetchFailure::Connection(e.0))?;
    if reply.status != 200 {
        return Err(FetchFailure::Status(reply.status));
    }
    match framing.decode(&reply.body) {
        ServiceReply::Formatted(renderings) => Ok(renderings),
        ServiceReply::Rejected(msg) => Err(FetchFailure::Rejected(msg)),
        ServiceReply::Malformed(msg) => Err(FetchFailure::Malformed(msg)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one request, tagged with its block
struct Completion {
    id: BlockId,
    result: std::result::Result<HttpReply, TransportError>,
}

/// Requests the queue keeps in flight at once
const FETCH_WORKERS: usize = 8;

/// A request waiting for a free worker
struct PendingFetch {
    id: BlockId,
    request: EncodedRequest,
}

/// Requests run on a fixed pool of worker threads; completions come back over
/// a channel to the thread that owns the page.
struct FetchQueue {
    /// `None` when no worker could be started
    jobs: Option<Sender<PendingFetch>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    in_flight: usize,
}

impl FetchQueue {
    fn new(transport: Arc<dyn Transport>, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        let (job_tx, job_rx) = mpsc::channel::<PendingFetch>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut started = 0;
        for n in 0..workers.max(1) {
            let jobs = Arc::clone(&job_rx);
            let done = tx.clone();
            let transport = Arc::clone(&transport);
            let spawned = thread::Builder::new()
                .name(format!("pmtidy-fetch-{}", n))
                .spawn(move || fetch_worker(&*transport, &jobs, &done));
            if spawned.is_ok() {
                started += 1;
            }
        }

        Self {
            jobs: (started > 0).then_some(job_tx),
            tx,
            rx,
            in_flight: 0,
        }
    }

    fn submit(&mut self, id: BlockId, request: EncodedRequest) {
        let queued = match &self.jobs {
            Some(jobs) => jobs.send(PendingFetch { id, request }).is_ok(),
            None => false,
        };

        if !queued {
            let _ = self.tx.send(Completion {
                id,
                result: Err(TransportError(
                    "no request worker is running".to_string(),
                )),
            });
        }
        self.in_flight += 1;
    }

    /// Deliver completions in arrival order until none are left or `wait`
    /// elapses. Returns the number still in flight.
    fn drain(&mut self, wait: Duration, mut on_completion: impl FnMut(Completion)) -> usize {
        // A wait past the clock's range means no deadline
        let deadline = Instant::now().checked_add(wait);
        while self.in_flight > 0 {
            let next = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.rx.recv_timeout(deadline - now)
                }
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(completion) => {
                    self.in_flight -= 1;
                    on_completion(completion);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.in_flight
    }
}

/// Worker loop: take the next request, post it, report back. Ends when the
/// queue is dropped.
fn fetch_worker(
    transport: &dyn Transport,
    jobs: &Mutex<Receiver<PendingFetch>>,
    done: &Sender<Completion>,
) {
    loop {
        let next = match jobs.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(PendingFetch { id, request }) = next else {
            return;
        };
        let result = transport.post(&request);
        if done.send(Completion { id, result }).is_err() {
            return;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// A `--set ID=VIEW` toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Toggle {
    id: BlockId,
    view: View,
}

/// Parse a toggle like "3=hilite"
fn parse_toggle(s: &str) -> std::result::Result<Toggle, String> {
    let (id, view) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid toggle '{}': expected ID=VIEW", s))?;
    let id = id
        .trim()
        .parse::<BlockId>()
        .map_err(|_| format!("Invalid block id '{}' in '{}'", id.trim(), s))?;
    let view = View::from_str(view.trim(), true)
        .map_err(|_| format!("Invalid view '{}': expected plain, hilite or tidy", view.trim()))?;
    Ok(Toggle { id, view })
}

/// Default formatting service endpoint
const DEFAULT_ENDPOINT: &str = "http://juster.info/perl/pmtidy/";
/// Default User-Agent sent to the service
const DEFAULT_USER_AGENT: &str = "PMTidy/1.5";

/// PerlMonks Code Tidier: highlights and tidies code blocks via a perltidy service
#[derive(Parser, Debug)]
#[command(
    name = "pmtidy",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (file not found, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Strict mode: a code block ended in an error state\n  4  Parse error (invalid UTF-8 or binary input)\n"
)]
struct Args {
    /// Input HTML file(s). Reads from stdin if not provided.
    #[arg(value_name = "FILE")]
    inputs: Vec<PathBuf>,

    /// Path to config file (default: search for .pmtidyrc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Batch command to run once the service has answered
    #[arg(short = 'c', long = "command", value_enum)]
    batch: Option<MenuCommand>,

    /// Switch a single block after the batch command (e.g. "2=tidy"); repeatable
    #[arg(long = "set", value_name = "ID=VIEW", value_parser = parse_toggle)]
    toggles: Vec<Toggle>,

    /// Formatting service URL
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// Request/reply framing spoken by the service
    #[arg(long, value_enum)]
    framing: Option<FramingKind>,

    /// User-Agent header sent to the service
    #[arg(long, value_name = "AGENT")]
    user_agent: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "20")]
    timeout_secs: u64,

    /// How long to wait for all replies, in seconds
    #[arg(long, default_value = "30")]
    wait_secs: u64,

    /// Do not contact the service (blocks keep their placeholders)
    #[arg(long)]
    no_fetch: bool,

    /// Do not inject the token style sheet
    #[arg(long)]
    no_style: bool,

    /// Edit file(s) in place
    #[arg(short = 'i', long)]
    in_place: bool,

    /// Create backup file before in-place editing
    #[arg(long, requires = "in_place")]
    backup: bool,

    /// Extension for backup files (default: .bak)
    #[arg(long, default_value = ".bak", requires = "backup")]
    backup_ext: String,

    /// Show unified diff of changes instead of full output
    #[arg(short = 'd', long)]
    diff: bool,

    /// Output results as JSON for programmatic processing
    #[arg(long, conflicts_with_all = ["verbose", "diff"])]
    json: bool,

    /// Exit with code 3 if any block ends in an error state
    #[arg(long)]
    strict: bool,

    /// Verbose output showing locator and fetch progress
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Subcommand (block listing, config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// List the code blocks of a page without contacting the service
    Blocks {
        /// Input HTML file. Reads from stdin if not provided.
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .pmtidyrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args
#[derive(Debug)]
struct Config {
    endpoint: String,
    framing: FramingKind,
    user_agent: String,
    timeout_secs: u64,
    wait_secs: u64,
    delimited: DelimitedConfig,
    command: Option<MenuCommand>,
    toggles: Vec<Toggle>,
    fetch: bool,
    style: bool,
    strict: bool,
    color: ColorMode,
    verbose: bool,
    diff: bool,
    json: bool,
    backup: bool,
    backup_ext: String,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            endpoint: args
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            framing: args.framing.unwrap_or(FramingKind::Xml),
            user_agent: args
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_secs: args.timeout_secs,
            wait_secs: args.wait_secs,
            delimited: DelimitedConfig::default(),
            command: args.batch,
            toggles: args.toggles.clone(),
            fetch: !args.no_fetch,
            style: !args.no_style,
            strict: args.strict,
            color: args.color,
            verbose: args.verbose,
            diff: args.diff,
            json: args.json,
            backup: args.backup,
            backup_ext: args.backup_ext.clone(),
        }
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn block(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn failure(&self, text: impl fmt::Display) -> String {
        self.wrap("bold red", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Print a statistics summary to stderr
fn print_stats_summary(
    stats: &Stats,
    files_processed: usize,
    errors: usize,
    console: &Console,
    styles: &VerboseStyle,
) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    if files_processed > 1 {
        console.print(&format!(
            "  {} {} processed",
            styles.stat_label("Files:"),
            files_processed
        ));
    }

    console.print(&format!(
        "  {} {} found, {} registered, {} skipped",
        styles.stat_label("Blocks:"),
        stats.leaves_found,
        stats.blocks_registered,
        stats.blocks_rejected
    ));

    console.print(&format!(
        "  {} {} sent, {} answered, {} pending",
        styles.stat_label("Requests:"),
        stats.requests_sent,
        stats.replies_received,
        stats.replies_pending
    ));

    console.print(&format!(
        "  {} {} plain, {} hilite, {} tidy, {} skipped, {} cgi error",
        styles.stat_label("Status:"),
        stats.original,
        stats.highlighted,
        stats.tidied,
        stats.syntax_errors,
        stats.transport_errors
    ));

    console.print(&format!(
        "  {} {:.2}ms",
        styles.stat_label("Time:"),
        stats.elapsed.as_secs_f64() * 1000.0
    ));

    if errors > 0 {
        console.print(&format!(
            "  {} {}",
            styles.wrap("bold red", "Errors:"),
            errors
        ));
    }

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".pmtidyrc", ".pmtidyrc.toml", "pmtidyrc.toml"];

/// Configuration loaded from a .pmtidyrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Formatting service URL
    endpoint: Option<String>,
    /// Framing: delimited or xml
    framing: Option<FramingKind>,
    /// User-Agent header
    user_agent: Option<String>,
    /// Per-request timeout
    timeout_secs: Option<u64>,
    /// Overall wait for replies
    wait_secs: Option<u64>,
    /// Batch command after fetching
    command: Option<MenuCommand>,
    /// Contact the service at all
    fetch: Option<bool>,
    /// Inject the token style sheet
    style: Option<bool>,
    /// Exit 3 on block errors
    strict: Option<bool>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
    /// Create backup before in-place edit
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
    /// Markers of the delimited framing
    delimited: Option<DelimitedConfig>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        let start_dir = args
            .inputs
            .first()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

        find_config_file(&start_dir)
    };

    if let Some(path) = config_path {
        merge_file_config(&mut config, args, load_config_file(&path)?);
    }

    Ok(config)
}

/// Apply file values wherever the CLI left the default
fn merge_file_config(config: &mut Config, args: &Args, file: FileConfig) {
    if args.endpoint.is_none() {
        if let Some(endpoint) = file.endpoint {
            config.endpoint = endpoint;
        }
    }

    if args.framing.is_none() {
        if let Some(framing) = file.framing {
            config.framing = framing;
        }
    }

    if args.user_agent.is_none() {
        if let Some(agent) = file.user_agent {
            config.user_agent = agent;
        }
    }

    if args.timeout_secs == 20 {
        if let Some(secs) = file.timeout_secs {
            config.timeout_secs = secs;
        }
    }

    if args.wait_secs == 30 {
        if let Some(secs) = file.wait_secs {
            config.wait_secs = secs;
        }
    }

    if args.batch.is_none() {
        if let Some(command) = file.command {
            config.command = Some(command);
        }
    }

    if !args.no_fetch {
        if let Some(fetch) = file.fetch {
            config.fetch = fetch;
        }
    }

    if !args.no_style {
        if let Some(style) = file.style {
            config.style = style;
        }
    }

    if !args.strict {
        if let Some(strict) = file.strict {
            config.strict = strict;
        }
    }

    if !args.verbose {
        if let Some(v) = file.verbose {
            config.verbose = v;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file.color {
            config.color = c;
        }
    }

    if !args.json {
        if let Some(j) = file.json {
            config.json = j;
        }
    }

    if !args.backup {
        if let Some(b) = file.backup {
            config.backup = b;
        }
    }

    if args.backup_ext == ".bak" {
        if let Some(ext) = file.backup_ext {
            config.backup_ext = ext;
        }
    }

    if let Some(delimited) = file.delimited {
        config.delimited = delimited;
    }
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .pmtidyrc - pmtidy configuration file

# Formatting service
endpoint = "http://juster.info/perl/pmtidy/"
# "xml" (tidyreq/tidyresp) or "delimited" (form post, <div id=..> reply)
framing = "xml"
user_agent = "PMTidy/1.5"

# Seconds per request, and for all replies of a page together
timeout_secs = 20
wait_secs = 30

# Batch command once replies are in: revert, highlight or tidy
# command = "highlight"

# fetch = true
# style = true
# strict = false

# Output options
# verbose = false
# color = "auto"
# json = false

# Backup options (for --in-place)
# backup = false
# backup_ext = ".bak"

# Markers of the delimited framing
# [delimited]
# sentinel = "How very unperlish of you!"
# highlight_id = "highlight"
# tidy_id = "tidy"
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".pmtidyrc")
            } else {
                PathBuf::from(".pmtidyrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let args = Args::parse_from(["pmtidy"]);
            let config = create_config(&args)?;

            eprintln!("Effective configuration:");
            eprintln!("  endpoint: {}", config.endpoint);
            eprintln!("  framing: {:?}", config.framing);
            eprintln!("  user_agent: {}", config.user_agent);
            eprintln!("  timeout_secs: {}", config.timeout_secs);
            eprintln!("  wait_secs: {}", config.wait_secs);
            if let Some(command) = config.command {
                eprintln!("  command: {:?}", command);
            }
            eprintln!("  fetch: {}", config.fetch);
            eprintln!("  style: {}", config.style);
            eprintln!("  strict: {}", config.strict);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);
            eprintln!("  backup: {}", config.backup);
            eprintln!("  backup_ext: {}", config.backup_ext);
            if config.framing == FramingKind::Delimited {
                eprintln!("  delimited.sentinel: {}", config.delimited.sentinel);
                eprintln!("  delimited.highlight_id: {}", config.delimited.highlight_id);
                eprintln!("  delimited.tidy_id: {}", config.delimited.tidy_id);
            }

            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                println!("{}", path.display());
                Ok(())
            } else {
                eprintln!("No config file found");
                std::process::exit(1);
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.timeout_secs == 0 {
        return Err(ArgError("--timeout-secs must be at least 1".to_string()).into());
    }

    if args.in_place && args.inputs.is_empty() {
        return Err(ArgError("--in-place requires at least one input file".to_string()).into());
    }

    if args.in_place && args.diff {
        return Err(ArgError("--in-place cannot be combined with --diff".to_string()).into());
    }

    Ok(())
}

/// Upper bound for `timeout_secs` and `wait_secs` (one day)
const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

fn validate_config(config: &Config) -> Result<()> {
    if config.timeout_secs > MAX_WAIT_SECS {
        return Err(ArgError(format!(
            "timeout_secs must be at most {} (got {})",
            MAX_WAIT_SECS, config.timeout_secs
        ))
        .into());
    }

    if config.wait_secs > MAX_WAIT_SECS {
        return Err(ArgError(format!(
            "wait_secs must be at most {} (got {})",
            MAX_WAIT_SECS, config.wait_secs
        ))
        .into());
    }

    if config.fetch
        && !config.endpoint.starts_with("http://")
        && !config.endpoint.starts_with("https://")
    {
        return Err(ArgError(format!(
            "Endpoint must be an http:// or https:// URL: {}",
            config.endpoint
        ))
        .into());
    }

    if config.timeout_secs == 0 {
        return Err(ArgError("timeout_secs must be at least 1".to_string()).into());
    }

    Ok(())
}

/// Statistics collected while rendering
#[derive(Default, Clone)]
struct Stats {
    /// Candidate code leaves on the page
    leaves_found: usize,
    /// Leaves that located and became blocks
    blocks_registered: usize,
    /// Leaves rejected by the locator
    blocks_rejected: usize,
    /// Requests sent to the service
    requests_sent: usize,
    /// Completions received before the deadline
    replies_received: usize,
    /// Requests still unanswered at the deadline
    replies_pending: usize,
    /// Final status counts
    original: usize,
    highlighted: usize,
    tidied: usize,
    syntax_errors: usize,
    transport_errors: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    /// Merge another Stats into this one (for aggregating across files)
    fn merge(&mut self, other: &Stats) {
        self.leaves_found += other.leaves_found;
        self.blocks_registered += other.blocks_registered;
        self.blocks_rejected += other.blocks_rejected;
        self.requests_sent += other.requests_sent;
        self.replies_received += other.replies_received;
        self.replies_pending += other.replies_pending;
        self.original += other.original;
        self.highlighted += other.highlighted;
        self.tidied += other.tidied;
        self.syntax_errors += other.syntax_errors;
        self.transport_errors += other.transport_errors;
        self.elapsed += other.elapsed;
    }

    fn count_status(&mut self, status: Status) {
        match status {
            Status::Showing(View::Plain) => self.original += 1,
            Status::Showing(View::Hilite) => self.highlighted += 1,
            Status::Showing(View::Tidy) => self.tidied += 1,
            Status::Failed(Failure::Syntax) => self.syntax_errors += 1,
            Status::Failed(Failure::Transport) => self.transport_errors += 1,
        }
    }

    fn block_errors(&self) -> usize {
        self.syntax_errors + self.transport_errors
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    blocks: Vec<BlockReport>,
    processing: ProcessingStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// Per-block line of the JSON report and of `pmtidy blocks`
#[derive(Debug, Clone, Serialize)]
struct BlockReport {
    id: BlockId,
    tag: String,
    status: &'static str,
    visible: &'static str,
    resolved: bool,
    original_bytes: usize,
    #[serde(skip)]
    preview: String,
}

impl BlockReport {
    fn from_block(block: &CodeBlock) -> Self {
        let preview: String = block
            .state
            .original
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(60)
            .collect();
        Self {
            id: block.id,
            tag: block.tag.clone(),
            status: block.status().name(),
            visible: block.state.visible().label(),
            resolved: block.state.is_resolved(),
            original_bytes: block.state.original.len(),
            preview,
        }
    }
}

#[derive(Serialize)]
struct ProcessingStats {
    leaves_found: usize,
    blocks_registered: usize,
    blocks_rejected: usize,
    requests_sent: usize,
    replies_received: usize,
    replies_pending: usize,
    block_errors: usize,
}

impl From<&Stats> for ProcessingStats {
    fn from(stats: &Stats) -> Self {
        Self {
            leaves_found: stats.leaves_found,
            blocks_registered: stats.blocks_registered,
            blocks_rejected: stats.blocks_rejected,
            requests_sent: stats.requests_sent,
            replies_received: stats.replies_received,
            replies_pending: stats.replies_pending,
            block_errors: stats.block_errors(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Framing plus (unless `--no-fetch`) a transport
struct Service {
    framing: Box<dyn Framing>,
    transport: Option<Arc<dyn Transport>>,
}

impl Service {
    fn from_config(config: &Config) -> Self {
        let transport: Option<Arc<dyn Transport>> = if config.fetch {
            Some(Arc::new(HttpTransport::new(config)))
        } else {
            None
        };
        Self {
            framing: build_framing(config),
            transport,
        }
    }
}

/// Rendered page plus what happened to its blocks
struct RenderedPage {
    html: String,
    blocks: Vec<BlockReport>,
    stats: Stats,
}

/// Main rendering entry point
fn render_page(
    html: &str,
    config: &Config,
    service: &Service,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RenderedPage> {
    let started = Instant::now();
    let page = Page::parse(html);

    if config.style && page.inject_style() && config.verbose {
        console.print(&styles.dim("Injected token style sheet"));
    }

    let mut registry = Registry::build(&page)?;
    let mut stats = Stats {
        leaves_found: registry.leaves_found,
        blocks_registered: registry.len(),
        blocks_rejected: registry.rejected.len(),
        ..Stats::default()
    };

    if config.verbose {
        console.print(&format!(
            "{} {} code block(s), {} skipped",
            styles.header("Located"),
            registry.len(),
            registry.rejected.len()
        ));
        for reason in &registry.rejected {
            console.print(&styles.dim(format!("  Skipped code text: {}", reason)));
        }
    }

    if let Some(transport) = &service.transport {
        let mut queue = FetchQueue::new(Arc::clone(transport), FETCH_WORKERS);
        for job in registry.jobs() {
            queue.submit(job.id, service.framing.encode(&job));
            stats.requests_sent += 1;
        }

        let verbose = config.verbose;
        let framing = service.framing.as_ref();
        let pending = queue.drain(Duration::from_secs(config.wait_secs), |completion| {
            stats.replies_received += 1;
            let outcome = interpret(completion.result, framing);
            if verbose {
                match &outcome {
                    Ok(_) => console.print(&format!(
                        "  {} {}",
                        styles.block(format!("Block #{}:", completion.id)),
                        styles.success("formatted")
                    )),
                    Err(failure) => console.print(&format!(
                        "  {} {} ({})",
                        styles.block(format!("Block #{}:", completion.id)),
                        styles.failure(failure.kind().label()),
                        failure
                    )),
                }
            }
            registry.resolve(completion.id, outcome.map_err(|f| f.kind()));
        });
        stats.replies_pending = pending;

        if pending > 0 {
            eprintln!(
                "Warning: {} request(s) unanswered after {}s; those blocks keep their placeholders",
                pending, config.wait_secs
            );
        }
    }

    if let Some(command) = config.command {
        if config.verbose {
            console.print(&styles.bold(command.title()));
        }
        registry.run_command(command);
    }

    for toggle in &config.toggles {
        registry.dispatch(toggle.id, toggle.view)?;
    }

    let blocks: Vec<BlockReport> = registry.blocks().iter().map(BlockReport::from_block).collect();
    for block in registry.blocks() {
        stats.count_status(block.status());
    }

    let html = page.to_html()?;
    stats.elapsed = started.elapsed();

    Ok(RenderedPage {
        html,
        blocks,
        stats,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a backup of the file by appending the extension to the filename.
/// For example: "page.html" with extension ".bak" becomes "page.html.bak"
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read a page from a file path
fn read_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let source_label = path.display().to_string();
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    parse_bytes_to_text(bytes, &source_label)
}

/// Read a page from stdin
fn read_stdin_content() -> Result<String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("Failed to read stdin")?;
    parse_bytes_to_text(buf, "stdin")
}

/// Check raw bytes for binary content and valid UTF-8
fn parse_bytes_to_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

fn read_input(input: Option<&Path>) -> Result<(String, String)> {
    match input {
        Some(path) => Ok((read_file(path)?, path.display().to_string())),
        None => Ok((read_stdin_content()?, "stdin".to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Listing
// ─────────────────────────────────────────────────────────────────────────────

/// Run a subcommand
fn run_command(command: &Commands) -> Result<()> {
    match command {
        Commands::Blocks { input, json } => list_blocks(input.as_deref(), *json),
        Commands::Config { action } => run_config_command(action),
    }
}

/// List located blocks of a page; no request is made
fn list_blocks(input: Option<&Path>, json: bool) -> Result<()> {
    let (html, filename) = read_input(input)?;
    let page = Page::parse(&html);
    let registry = Registry::build(&page)?;
    let blocks: Vec<BlockReport> = registry.blocks().iter().map(BlockReport::from_block).collect();

    let mut stdout = io::stdout().lock();
    if json {
        #[derive(Serialize)]
        struct BlockListing<'a> {
            file: &'a str,
            leaves_found: usize,
            rejected: Vec<String>,
            blocks: &'a [BlockReport],
        }
        let listing = BlockListing {
            file: &filename,
            leaves_found: registry.leaves_found,
            rejected: registry.rejected.iter().map(ToString::to_string).collect(),
            blocks: &blocks,
        };
        writeln!(stdout, "{}", serde_json::to_string_pretty(&listing)?)?;
        return Ok(());
    }

    for block in &blocks {
        writeln!(
            stdout,
            "#{:<3} {:<4} {:>6} bytes  {}",
            block.id, block.tag, block.original_bytes, block.preview
        )?;
    }
    for reason in &registry.rejected {
        eprintln!("skipped: {}", reason);
    }
    if blocks.is_empty() && registry.rejected.is_empty() {
        eprintln!("No code blocks found in {}", filename);
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

/// Result of processing a single file or stdin
struct FileResult {
    filename: String,
    original: String,
    rendered: RenderedPage,
}

impl FileResult {
    fn would_change(&self) -> bool {
        self.original != self.rendered.html
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(command) = &args.command {
        let exit_code = match run_command(command) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.strict && outcome.block_errors {
                exit_codes::BLOCK_ERRORS
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

/// Process a single input (file or stdin) and return the result
fn process_input(
    html: String,
    filename: String,
    config: &Config,
    service: &Service,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<FileResult> {
    if config.verbose {
        console.print(&styles.bold(format!(
            "Processing {} ({} bytes)...",
            filename,
            html.len()
        )));
    }

    let rendered = render_page(&html, config, service, console, styles)
        .with_context(|| format!("Failed to render {}", filename))?;

    Ok(FileResult {
        filename,
        original: html,
        rendered,
    })
}

/// Output a unified diff for a file result
fn output_diff(result: &FileResult) -> Result<()> {
    if !result.would_change() {
        return Ok(());
    }

    let diff = TextDiff::from_lines(&result.original, &result.rendered.html);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", result.filename)?;
    writeln!(stdout, "+++ b/{}", result.filename)?;

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    validate_config(&config)?;
    let (console, styles) = build_console(config.color);
    let service = Service::from_config(&config);

    if config.verbose && config.fetch {
        console.print(&styles.dim(format!(
            "Using {} at {}",
            match config.framing {
                FramingKind::Delimited => "delimited framing",
                FramingKind::Xml => "XML framing",
            },
            config.endpoint
        )));
    }

    if args.inputs.len() > 1 {
        return output_multiple_results(&args, &config, &service, &console, &styles);
    }

    let (html, filename) = read_input(args.inputs.first().map(PathBuf::as_path))?;
    let result = process_input(html, filename, &config, &service, &console, &styles)?;
    output_single_result(&args, &config, &console, &styles, result)
}

fn write_in_place(path: &Path, config: &Config, result: &FileResult) -> Result<Option<PathBuf>> {
    let backup = if config.backup {
        Some(create_backup(path, &config.backup_ext)?)
    } else {
        None
    };
    fs::write(path, &result.rendered.html)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;
    Ok(backup)
}

/// Handle output for a single file/stdin result
fn output_single_result(
    args: &Args,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    result: FileResult,
) -> Result<RunOutcome> {
    let block_errors = result.rendered.stats.block_errors() > 0;

    if config.json {
        output_json_single(args, &result)?;
    } else if config.diff {
        output_diff(&result)?;
    } else if args.in_place {
        let path = args
            .inputs
            .first()
            .ok_or_else(|| ArgError("--in-place requires an input file".to_string()))?;
        let backup = write_in_place(path, config, &result)?;
        if config.verbose {
            if let Some(backup) = backup {
                console.print(&styles.dim(format!("Backup written to {}", backup.display())));
            }
            console.print(&styles.success(format!("Updated {}", path.display())));
        }
    } else {
        let mut stdout = io::stdout().lock();
        write!(stdout, "{}", result.rendered.html)?;
        if !result.rendered.html.ends_with('\n') {
            writeln!(stdout)?;
        }
    }

    if config.verbose {
        print_stats_summary(&result.rendered.stats, 1, 0, console, styles);
    }

    Ok(RunOutcome {
        strict: config.strict,
        block_errors,
    })
}

fn json_for(result: &FileResult, with_content: bool) -> JsonOutput {
    let stats = &result.rendered.stats;
    JsonOutput {
        version: env!("CARGO_PKG_VERSION"),
        status: if stats.block_errors() > 0 {
            "block_errors".to_string()
        } else {
            "ok".to_string()
        },
        file: Some(result.filename.clone()),
        blocks: result.rendered.blocks.clone(),
        processing: ProcessingStats::from(stats),
        content: with_content.then(|| result.rendered.html.clone()),
    }
}

/// Output JSON for a single file result
fn output_json_single(args: &Args, result: &FileResult) -> Result<()> {
    if args.in_place {
        let path = args
            .inputs
            .first()
            .ok_or_else(|| ArgError("--in-place requires an input file".to_string()))?;
        fs::write(path, &result.rendered.html)
            .with_context(|| format!("Failed to write output file: {}", path.display()))?;
    }
    let output = json_for(result, !args.in_place);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Handle output for multiple files
fn output_multiple_results(
    args: &Args,
    config: &Config,
    service: &Service,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    let mut aggregated_stats = Stats::default();
    let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();
    let mut json_outputs = Vec::new();
    let mut files_processed = 0;

    for path in &args.inputs {
        let result = read_file(path).and_then(|html| {
            process_input(
                html,
                path.display().to_string(),
                config,
                service,
                console,
                styles,
            )
        });

        match result {
            Ok(result) => {
                files_processed += 1;
                aggregated_stats.merge(&result.rendered.stats);

                if args.in_place {
                    let backup = write_in_place(path, config, &result)?;
                    if config.verbose {
                        if let Some(backup) = backup {
                            console.print(
                                &styles.dim(format!("Backup written to {}", backup.display())),
                            );
                        }
                        console.print(&styles.success(format!("Updated {}", path.display())));
                    }
                }

                if config.json {
                    json_outputs.push(json_for(&result, !args.in_place));
                } else if config.diff {
                    output_diff(&result)?;
                } else if !args.in_place {
                    let mut stdout = io::stdout().lock();
                    writeln!(stdout, "==> {} <==", path.display())?;
                    write!(stdout, "{}", result.rendered.html)?;
                    writeln!(stdout)?;
                    writeln!(stdout)?;
                }
            }
            Err(e) => {
                eprintln!("Error processing {}: {:#}", path.display(), e);
                errors.push((path.clone(), e));
            }
        }
    }

    if config.json {
        println!("{}", serde_json::to_string_pretty(&json_outputs)?);
    }

    if config.verbose {
        print_stats_summary(
            &aggregated_stats,
            files_processed,
            errors.len(),
            console,
            styles,
        );
    }

    if !errors.is_empty() {
        let files = errors
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let has_parse_error = errors
            .iter()
            .any(|(_, err)| error_chain_has::<ParseError>(err));

        if has_parse_error {
            return Err(ParseError(format!(
                "{} file(s) had parse errors: {}",
                errors.len(),
                files
            ))
            .into());
        }

        anyhow::bail!("{} file(s) had errors: {}", errors.len(), files);
    }

    Ok(RunOutcome {
        strict: config.strict,
        block_errors: aggregated_stats.block_errors() > 0,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
