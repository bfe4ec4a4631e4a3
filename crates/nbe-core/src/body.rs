//! Plain-text worksheet bodies
//!
//! A body is HTML text interleaved with compute blocks:
//!
//! ```text
//! <p>Some notes</p>
//!
//! {{{id=3|
//! 1+1
//! ///
//! 2
//! }}}
//! ```
//!
//! Text between blocks becomes text cells. Inside a block, the line `///`
//! separates the input from its last output.

use crate::cell::Cell;
use crate::error::EngineError;
use crate::ids::CellId;
use crate::worksheet::Worksheet;
use std::collections::HashSet;

const OPEN: &str = "{{{";
const CLOSE: &str = "}}}";
const DIVIDER: &str = "///";

/// One piece of a parsed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// HTML between compute blocks
    Text(String),
    /// A `{{{ ... }}}` block
    Compute {
        /// Id from the `id=N|` header, if any
        id: Option<u32>,
        input: String,
        output: String,
    },
}

/// Split a body into blocks. An unterminated compute block runs to the end.
#[must_use]
pub fn parse_body(body: &str) -> Vec<Block> {
    let body = body.replace("\r\n", "\n");
    let mut rest = body.as_str();
    let mut blocks = Vec::new();
    loop {
        let (text, block) = match rest.find(OPEN) {
            Some(at) => (&rest[..at], Some(&rest[at + OPEN.len()..])),
            None => (rest, None),
        };
        let text = text.trim();
        if !text.is_empty() {
            blocks.push(Block::Text(text.to_string()));
        }
        let Some(block) = block else {
            break;
        };

        let (header, content) = block.split_once('\n').unwrap_or((block, ""));
        let (id, content) = if header.is_empty() || header.ends_with('|') {
            (header_id(header), content)
        } else {
            // no header: the first line is already input
            (None, block)
        };
        let (inner, next) = if let Some(after) = content.strip_prefix(CLOSE) {
            ("", after)
        } else {
            match content.find(&format!("\n{CLOSE}")) {
                Some(at) => (&content[..at], &content[at + 1 + CLOSE.len()..]),
                None => (content, ""),
            }
        };
        let (input, output) = split_output(inner);
        blocks.push(Block::Compute { id, input, output });
        rest = next;
    }
    blocks
}

fn header_id(header: &str) -> Option<u32> {
    header
        .split('|')
        .find_map(|field| field.trim().strip_prefix("id=")?.parse().ok())
}

fn split_output(inner: &str) -> (String, String) {
    let mut input = Vec::new();
    let mut output = Vec::new();
    let mut divided = false;
    for line in inner.lines() {
        if !divided && line.trim_end() == DIVIDER {
            divided = true;
        } else if divided {
            output.push(line);
        } else {
            input.push(line);
        }
    }
    (input.join("\n"), output.join("\n"))
}

impl Worksheet {
    /// Every cell as a plain-text body, in document order
    #[must_use]
    pub fn body_text(&self) -> String {
        let mut body = String::new();
        for cell in &self.cells {
            let block = if cell.is_text() {
                cell.input().trim().to_string()
            } else {
                format!(
                    "{OPEN}id={}|\n{}\n{DIVIDER}\n{}\n{CLOSE}",
                    cell.id().0,
                    cell.input(),
                    cell.committed_output().text
                )
            };
            if block.is_empty() {
                continue;
            }
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&block);
        }
        body
    }

    /// Replace every cell with the blocks of `body`.
    ///
    /// Computation is halted first. Compute blocks whose `id` names an
    /// existing compute cell keep that id; every other cell gets a fresh one.
    /// The worksheet always ends with a compute cell. Returns the new state
    /// number.
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn replace_body(&mut self, user: Option<&str>, body: &str) -> Result<u64, EngineError> {
        self.ensure_editable()?;
        self.halt();
        let existing: HashSet<CellId> = self
            .cells
            .iter()
            .filter(|c| !c.is_text())
            .map(Cell::id)
            .collect();
        let mut reused = HashSet::new();
        let mut cells = Vec::new();
        for block in parse_body(body) {
            match block {
                Block::Text(html) => {
                    let id = self.allocate_cell_id();
                    cells.push(Cell::text(id, html));
                }
                Block::Compute { id, input, output } => {
                    let id = match id.map(CellId) {
                        Some(id) if existing.contains(&id) && reused.insert(id) => id,
                        _ => self.allocate_cell_id(),
                    };
                    let mut cell = Cell::new(id, input);
                    cell.set_committed_text(output);
                    cells.push(cell);
                }
            }
        }
        if cells.last().map_or(true, Cell::is_text) {
            let id = self.allocate_cell_id();
            cells.push(Cell::new(id, ""));
        }

        let dropped: Vec<CellId> = self
            .cells
            .iter()
            .map(Cell::id)
            .filter(|old| !cells.iter().any(|c| c.id() == *old))
            .collect();
        self.cells = cells;
        self.record(user);
        for id in dropped {
            self.tracker.record_deletion(id);
        }
        self.tracker.mark_structure_changed();
        for idx in 0..self.cells.len() {
            self.touch_cell(idx);
        }
        tracing::info!(worksheet = %self.id, cells = self.cells.len(), "worksheet body replaced");
        Ok(self.state_number())
    }
}
