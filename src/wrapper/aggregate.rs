//! Adjacent-message aggregation.
//!
//! Wrappers do not render history items one by one. Consecutive items of
//! compatible roles are first merged into one block, joined by a blank line,
//! and the block is then wrapped in the family's delimiters. Which roles
//! merge differs per family and is expressed by [`ChunkPolicy`].

use crate::history::{ChatHistoryItem, ModelResponseItem};
use crate::text::LlamaText;

const BLOCK_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Model,
}

impl Role {
    pub fn of(item: &ChatHistoryItem) -> Role {
        match item {
            ChatHistoryItem::System { .. } => Role::System,
            ChatHistoryItem::User { .. } => Role::User,
            ChatHistoryItem::Model { .. } => Role::Model,
        }
    }
}

/// When a new item starts a fresh chunk instead of joining the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// System texts join each other; user texts join a preceding system or
    /// user run; model texts always join the current chunk.
    JoinSystemAndUser,
    /// Only consecutive system texts join; user and model texts always open
    /// a new chunk.
    JoinSystem,
    /// Every item opens a new chunk.
    Separate,
}

impl ChunkPolicy {
    /// [`ChunkPolicy::JoinSystemAndUser`], or [`ChunkPolicy::Separate`]
    /// when joining adjacent messages is turned off.
    pub fn joined_if(join_adjacent_messages: bool) -> ChunkPolicy {
        if join_adjacent_messages {
            ChunkPolicy::JoinSystemAndUser
        } else {
            ChunkPolicy::Separate
        }
    }

    fn flushes_before(self, role: Role, focus: Option<Role>) -> bool {
        match self {
            ChunkPolicy::Separate => true,
            ChunkPolicy::JoinSystemAndUser => match role {
                Role::System => focus != Some(Role::System),
                Role::User => !matches!(focus, Some(Role::System) | Some(Role::User)),
                Role::Model => false,
            },
            ChunkPolicy::JoinSystem => match role {
                Role::System => focus != Some(Role::System),
                Role::User | Role::Model => true,
            },
        }
    }
}

/// One aggregated block. Absent roles are empty texts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatChunk {
    pub system: LlamaText,
    pub user: LlamaText,
    pub model: LlamaText,
}

#[derive(Default)]
struct ChunkBuilder {
    system: Vec<LlamaText>,
    user: Vec<LlamaText>,
    model: Vec<LlamaText>,
}

impl ChunkBuilder {
    fn flush_into(&mut self, out: &mut Vec<ChatChunk>) {
        if self.system.is_empty() && self.user.is_empty() && self.model.is_empty() {
            return;
        }
        out.push(ChatChunk {
            system: LlamaText::join(BLOCK_SEPARATOR, self.system.drain(..)),
            user: LlamaText::join(BLOCK_SEPARATOR, self.user.drain(..)),
            model: LlamaText::join(BLOCK_SEPARATOR, self.model.drain(..)),
        });
    }
}

/// Group `history` into system/user/model chunks.
pub fn chunk_chat_items<F>(history: &[ChatHistoryItem], policy: ChunkPolicy, mut render_model: F) -> Vec<ChatChunk>
where
    F: FnMut(&[ModelResponseItem]) -> LlamaText,
{
    let mut chunks = Vec::new();
    let mut builder = ChunkBuilder::default();
    let mut focus: Option<Role> = None;

    for item in history {
        let role = Role::of(item);
        if policy.flushes_before(role, focus) {
            builder.flush_into(&mut chunks);
        }
        focus = Some(role);

        match item {
            ChatHistoryItem::System { text } => builder.system.push(text.clone()),
            ChatHistoryItem::User { text } => builder.user.push(LlamaText::from(text)),
            ChatHistoryItem::Model { response } => builder.model.push(render_model(response)),
        }
    }
    builder.flush_into(&mut chunks);

    chunks
}

/// Consecutive texts of a single role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRun {
    pub role: Role,
    pub texts: Vec<LlamaText>,
}

impl RoleRun {
    pub fn text(&self) -> LlamaText {
        self.join(BLOCK_SEPARATOR)
    }

    pub fn join(&self, separator: impl Into<LlamaText>) -> LlamaText {
        LlamaText::join(separator, self.texts.iter())
    }
}

/// Split `history` into runs of one role. With `join_adjacent_messages`
/// off every item is its own run.
pub fn role_runs<F>(history: &[ChatHistoryItem], join_adjacent_messages: bool, mut render_model: F) -> Vec<RoleRun>
where
    F: FnMut(&[ModelResponseItem]) -> LlamaText,
{
    let mut runs: Vec<RoleRun> = Vec::new();

    for item in history {
        let role = Role::of(item);
        let text = match item {
            ChatHistoryItem::System { text } => text.clone(),
            ChatHistoryItem::User { text } => LlamaText::from(text),
            ChatHistoryItem::Model { response } => render_model(response),
        };

        match runs.last_mut() {
            Some(run) if join_adjacent_messages && run.role == role => run.texts.push(text),
            _ => runs.push(RoleRun { role, texts: vec![text] }),
        }
    }

    runs
}
