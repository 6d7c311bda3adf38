use crate::notebook::Notebook;
use crate::scheduler::RunReport;
use crate::NotebookError;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use nbflow_core::settings::Prompts;
use nbflow_core::{CellId, CellKind, TEST_MARKER};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CHAT_MODEL: &str = "ollama/llama3";

const PROVIDER_ERROR_PREFIX: &str = "[Error:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Token stream for a chat-style message list. Providers live elsewhere.
pub trait ChatModel: Send + Sync {
    fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxStream<'static, Result<String, AssistError>>;
}

#[derive(Debug, Error)]
pub enum AssistError {
    #[error("cell {0} is empty")]
    EmptyCell(CellId),
    #[error("cell {0} does not start with a function definition")]
    NoDefinition(CellId),
    #[error("model provider failed: {0}")]
    Provider(String),
    #[error(transparent)]
    Notebook(#[from] NotebookError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Refactor,
    GenerateTests,
    GenerateDocstring,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Refactor => "refactor",
            Action::GenerateTests => "generate_tests",
            Action::GenerateDocstring => "generate_docstring",
        }
    }

    fn prompt<'a>(&self, prompts: &'a Prompts) -> &'a str {
        match self {
            Action::Refactor => &prompts.refactor,
            Action::GenerateTests => &prompts.generate_tests,
            Action::GenerateDocstring => &prompts.generate_docstring,
        }
    }
}

/// Replaces the cell with the model's rewrite. The edit is local, so it is
/// broadcast and may trigger a reactive run.
pub async fn refactor_cell(
    notebook: &mut Notebook,
    model: &dyn ChatModel,
    cell_id: CellId,
) -> Result<Option<RunReport>, AssistError> {
    let source = code_source(notebook, cell_id)?;
    let rewritten = complete(notebook, model, Action::Refactor, &source).await?;
    Ok(notebook.edit_cell(cell_id, rewritten).await?)
}

pub async fn generate_tests(
    notebook: &mut Notebook,
    model: &dyn ChatModel,
    cell_id: CellId,
) -> Result<CellId, AssistError> {
    let source = code_source(notebook, cell_id)?;
    let tests = complete(notebook, model, Action::GenerateTests, &source).await?;
    let index = notebook
        .position_of(cell_id)
        .map(|position| position + 1)
        .ok_or(NotebookError::UnknownCell(cell_id))?;
    let test_cell = notebook.add_cell(CellKind::Code, format!("{TEST_MARKER}\n{tests}"), Some(index))?;
    Ok(test_cell)
}

/// Puts a generated docstring under the `def` on the cell's first line.
pub async fn insert_docstring(
    notebook: &mut Notebook,
    model: &dyn ChatModel,
    cell_id: CellId,
) -> Result<Option<RunReport>, AssistError> {
    let source = code_source(notebook, cell_id)?;
    if docstring_indent(&source).is_none() {
        return Err(AssistError::NoDefinition(cell_id));
    }
    let docstring = complete(notebook, model, Action::GenerateDocstring, &source).await?;
    let updated = with_docstring(&source, &docstring).ok_or(AssistError::NoDefinition(cell_id))?;
    Ok(notebook.edit_cell(cell_id, updated).await?)
}

fn code_source(notebook: &Notebook, cell_id: CellId) -> Result<String, AssistError> {
    let cell = notebook
        .cell(cell_id)
        .ok_or(NotebookError::UnknownCell(cell_id))?;
    if !cell.is_code() {
        return Err(NotebookError::NotCode(cell_id).into());
    }
    if cell.content().trim().is_empty() {
        return Err(AssistError::EmptyCell(cell_id));
    }
    Ok(cell.content().to_string())
}

async fn complete(
    notebook: &Notebook,
    model: &dyn ChatModel,
    action: Action,
    source: &str,
) -> Result<String, AssistError> {
    let settings = notebook.settings();
    let model_name = match settings.chat_model.trim() {
        "" => DEFAULT_CHAT_MODEL,
        configured => configured,
    };
    let messages = vec![
        ChatMessage::system(action.prompt(&settings.prompts)),
        ChatMessage::user(source),
    ];
    info!(event = "assist_request", action = action.as_str(), model = model_name);

    let mut stream = model.stream_chat(model_name, messages);
    let mut text = String::new();
    while let Some(token) = stream.next().await {
        text.push_str(&token?);
    }

    let text = text.trim();
    if text.is_empty() {
        warn!(event = "assist_empty_response", action = action.as_str());
        return Err(AssistError::Provider("empty response".to_string()));
    }
    if text.starts_with(PROVIDER_ERROR_PREFIX) {
        warn!(event = "assist_provider_error", action = action.as_str(), detail = text);
        return Err(AssistError::Provider(text.to_string()));
    }
    Ok(text.to_string())
}

fn docstring_indent(source: &str) -> Option<String> {
    let first = source.split('\n').next()?;
    let def_at = first.find("def ")?;
    Some(" ".repeat(def_at + 4))
}

fn with_docstring(source: &str, docstring: &str) -> Option<String> {
    let indent = docstring_indent(source)?;
    let (first, rest) = source.split_once('\n').unwrap_or((source, ""));
    let quoted = format!("\"\"\"{docstring}\"\"\"")
        .split('\n')
        .collect::<Vec<_>>()
        .join(&format!("\n{indent}"));
    Some(format!("{first}\n{indent}{quoted}\n{rest}"))
}
