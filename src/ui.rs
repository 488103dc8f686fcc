use anyhow::Result;
use chrono::Local;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use ratatui::{
    backend::Backend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tui_textarea::{CursorMove, TextArea};

use crate::config::{self, ThemeConfig};
use crate::model::{AuthProvider, FileUpload, Note};
use crate::session::{Session, SessionState};

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

#[derive(PartialEq, Debug, Clone, Copy)]
enum ActivePane {
    Auth,
    List,
    Editor,
    DeleteConfirm,
    UploadPrompt,
}

#[derive(PartialEq, Debug, Clone, Copy)]
enum EditorField {
    Title,
    Content,
}

#[derive(Debug)]
enum Message {
    Key(KeyEvent),
    Paste(String),
    StateChanged,
    Tick,
}

pub struct Model<'a> {
    session: Arc<Session>,
    state_rx: watch::Receiver<SessionState>,
    state: SessionState,
    theme: ThemeConfig,
    offline: bool,
    captcha_site_key: Option<String>,

    active_pane: ActivePane,
    field: EditorField,
    list_state: ListState,
    title_area: TextArea<'a>,
    content_area: TextArea<'a>,
    captcha_input: TextArea<'a>,
    upload_input: TextArea<'a>,
    seen_revision: u64,

    spinner_index: usize,
    notice: Option<String>,
}

impl<'a> Model<'a> {
    pub fn new(session: Arc<Session>, theme: ThemeConfig, offline: bool) -> Self {
        let state_rx = session.watch();
        let state = state_rx.borrow().clone();
        let mut model = Self {
            session,
            state_rx,
            state,
            theme,
            offline,
            captcha_site_key: None,
            active_pane: ActivePane::Auth,
            field: EditorField::Content,
            list_state: ListState::default(),
            title_area: TextArea::default(),
            content_area: TextArea::default(),
            captcha_input: TextArea::default(),
            upload_input: TextArea::default(),
            seen_revision: 0,
            spinner_index: 0,
            notice: None,
        };
        model.reset_captcha_input();
        model.sync_from_state();
        model
    }

    /// Shown on the auth card so the token can be solved for the right site.
    pub fn with_captcha_site_key(mut self, site_key: Option<String>) -> Self {
        self.captcha_site_key = site_key.filter(|k| !k.trim().is_empty());
        self
    }

    fn reset_captcha_input(&mut self) {
        self.captcha_input = TextArea::default();
        self.captcha_input.set_block(
            Block::default()
                .borders(Borders::ALL)
                .title(" reCAPTCHA token ")
                .border_style(Style::default().fg(self.theme.border_active)),
        );
        self.captcha_input.set_mask_char('•');
    }

    fn reset_upload_input(&mut self) {
        self.upload_input = TextArea::default();
        self.upload_input.set_block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Attach file (path) ")
                .border_style(Style::default().fg(self.theme.border_active)),
        );
    }

    /// Rebuilds the editor fields from the session's draft.
    fn load_draft(&mut self) {
        self.title_area = TextArea::from([self.state.draft.title.clone()]);
        self.content_area = TextArea::from(self.state.draft.content.split('\n'));
        for area in [&mut self.title_area, &mut self.content_area] {
            area.move_cursor(CursorMove::Bottom);
            area.move_cursor(CursorMove::End);
        }
        self.seen_revision = self.state.draft_revision;
    }

    fn sync_from_state(&mut self) {
        self.state = self.state_rx.borrow_and_update().clone();

        if self.state.draft_revision != self.seen_revision {
            self.load_draft();
        }

        let index = self
            .state
            .selected_id
            .as_ref()
            .and_then(|id| self.state.notes.iter().position(|n| &n.id == id));
        self.list_state.select(index);

        match (self.state.user.is_some(), self.active_pane) {
            (false, ActivePane::Auth) => {}
            (false, _) => self.active_pane = ActivePane::Auth,
            (true, ActivePane::Auth) => {
                self.reset_captcha_input();
                self.active_pane = ActivePane::List;
            }
            (true, _) => {}
        }
        if self.active_pane == ActivePane::DeleteConfirm && self.state.selected().is_none() {
            self.active_pane = ActivePane::List;
        }
    }

    fn launch<F, Fut>(&self, command: F)
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(command(Arc::clone(&self.session)));
    }

    /// Runs a backend command unless another one is still in flight.
    fn launch_exclusive<F, Fut>(&mut self, command: F)
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.state.busy {
            self.notice = Some("Still working on the previous action".to_string());
            return;
        }
        self.notice = None;
        self.launch(command);
    }

    fn move_list_selection(&mut self, delta: i32) {
        let notes = &self.state.notes;
        if notes.is_empty() {
            return;
        }
        let next = match self.list_state.selected() {
            Some(i) => (i as i32 + delta).clamp(0, notes.len() as i32 - 1) as usize,
            None => 0,
        };
        let id = notes[next].id.clone();
        self.session.select(Some(id));
    }

    fn push_editor_change(&mut self) {
        match self.field {
            EditorField::Title => self.session.edit_title(self.title_area.lines().join(" ")),
            EditorField::Content => self
                .session
                .edit_content(self.content_area.lines().join("\n")),
        }
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<bool> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if ctrl && key.code == KeyCode::Char('c') {
            return Ok(true);
        }

        match self.active_pane {
            ActivePane::Auth => {
                if self.state.captcha_ok {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
                        KeyCode::Char('g') => {
                            self.launch(|s| async move { s.login(AuthProvider::Google).await })
                        }
                        KeyCode::Char('h') => {
                            self.launch(|s| async move { s.login(AuthProvider::GitHub).await })
                        }
                        _ => {}
                    }
                } else {
                    match key.code {
                        KeyCode::Esc => return Ok(true),
                        KeyCode::Enter => {
                            if self.state.captcha_loading {
                                return Ok(false);
                            }
                            let token = self.captcha_input.lines().join("").trim().to_string();
                            self.reset_captcha_input();
                            if !token.is_empty() {
                                self.launch(|s| async move { s.verify_captcha(&token).await });
                            }
                        }
                        _ => {
                            self.captcha_input.input(key);
                        }
                    }
                }
            }
            ActivePane::List => match key.code {
                KeyCode::Char('q') => return Ok(true),
                KeyCode::Char('j') | KeyCode::Down => self.move_list_selection(1),
                KeyCode::Char('k') | KeyCode::Up => self.move_list_selection(-1),
                KeyCode::Char('n') => self.launch_exclusive(|s| async move { s.create().await }),
                KeyCode::Char('s') if ctrl => {
                    self.launch_exclusive(|s| async move { s.save().await })
                }
                KeyCode::Char('s') => {
                    if self.state.selected().is_some() {
                        self.launch_exclusive(|s| async move { s.summarize().await });
                    }
                }
                KeyCode::Char('d') => {
                    if self.state.selected().is_some() && !self.state.busy {
                        self.active_pane = ActivePane::DeleteConfirm;
                    }
                }
                KeyCode::Char('u') => {
                    if self.state.selected().is_some() {
                        self.reset_upload_input();
                        self.active_pane = ActivePane::UploadPrompt;
                    }
                }
                KeyCode::Char('o') => {
                    if let Some(url) = self.state.selected().and_then(|n| n.file_url.clone()) {
                        if let Err(e) = webbrowser::open(&url) {
                            tracing::warn!("Could not open {}: {}", url, e);
                        }
                    }
                }
                KeyCode::Char('L') => self.launch(|s| async move { s.logout().await }),
                KeyCode::Enter | KeyCode::Char('e') | KeyCode::Tab => {
                    if self.state.selected().is_some() {
                        self.active_pane = ActivePane::Editor;
                        self.field = EditorField::Content;
                    }
                }
                _ => {}
            },
            ActivePane::Editor => match key.code {
                KeyCode::Esc => self.active_pane = ActivePane::List,
                KeyCode::Char('s') if ctrl => {
                    self.launch_exclusive(|s| async move { s.save().await })
                }
                KeyCode::Tab | KeyCode::BackTab => {
                    self.field = match self.field {
                        EditorField::Title => EditorField::Content,
                        EditorField::Content => EditorField::Title,
                    }
                }
                KeyCode::Enter if self.field == EditorField::Title => {
                    self.field = EditorField::Content;
                }
                // Input is frozen while a command runs or the note is gone.
                _ if self.state.busy || self.state.selected().is_none() => {}
                _ => {
                    let changed = match self.field {
                        EditorField::Title => self.title_area.input(key),
                        EditorField::Content => self.content_area.input(key),
                    };
                    if changed {
                        self.push_editor_change();
                    }
                }
            },
            ActivePane::DeleteConfirm => match key.code {
                KeyCode::Char('y') => {
                    self.launch_exclusive(|s| async move { s.delete().await });
                    self.active_pane = ActivePane::List;
                }
                KeyCode::Char('n') | KeyCode::Esc => self.active_pane = ActivePane::List,
                _ => {}
            },
            ActivePane::UploadPrompt => match key.code {
                KeyCode::Esc => self.active_pane = ActivePane::List,
                KeyCode::Enter => {
                    let raw = self.upload_input.lines().join("");
                    let path = raw.trim();
                    self.active_pane = ActivePane::List;
                    if path.is_empty() {
                        return Ok(false);
                    }
                    match FileUpload::read(Path::new(path)).await {
                        Ok(file) => {
                            self.launch_exclusive(|s| async move { s.upload_file(Some(file)).await })
                        }
                        Err(e) => {
                            tracing::warn!("Could not read {}: {}", path, e);
                            self.notice = Some(format!("Cannot read {}: {}", path, e));
                        }
                    }
                }
                _ => {
                    self.upload_input.input(key);
                }
            },
        }
        Ok(false)
    }

    async fn update(&mut self, msg: Message) -> Result<bool> {
        match msg {
            Message::Key(key) => {
                if matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                    return self.handle_key_event(key).await;
                }
            }
            Message::Paste(text) => {
                let text = text.replace('\r', "");
                match self.active_pane {
                    ActivePane::Editor => {
                        match self.field {
                            EditorField::Title => {
                                self.title_area.insert_str(text.replace('\n', " "));
                            }
                            EditorField::Content => {
                                self.content_area.insert_str(text);
                            }
                        }
                        self.push_editor_change();
                    }
                    ActivePane::Auth => {
                        self.captcha_input.insert_str(text.trim());
                    }
                    ActivePane::UploadPrompt => {
                        self.upload_input.insert_str(text.trim());
                    }
                    _ => {}
                }
            }
            Message::StateChanged => self.sync_from_state(),
            Message::Tick => {
                self.spinner_index = (self.spinner_index + 1) % SPINNER.len();
            }
        }
        Ok(false)
    }

    pub async fn run<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let mut spinner_interval = time::interval(Duration::from_millis(100));

        let mut events = EventStream::new();

        let mut should_render = true;
        loop {
            if should_render {
                terminal.draw(|f| self.ui(f))?;
                should_render = false;
            }

            let animating = self.state.busy || self.state.captcha_loading;
            let mut messages = Vec::new();
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(Event::Key(key))) => messages.push(Message::Key(key)),
                    Some(Ok(Event::Paste(text))) => messages.push(Message::Paste(text)),
                    Some(Ok(Event::Resize(_, _))) => messages.push(Message::Tick),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    messages.push(Message::StateChanged);
                }
                _ = spinner_interval.tick(), if animating => messages.push(Message::Tick),
            }

            for msg in messages {
                if self.update(msg).await? {
                    return Ok(());
                }
                should_render = true;
            }
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let theme = self.theme.clone();

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(1),
                Constraint::Length(2),
            ])
            .split(f.area());

        let who = match &self.state.user {
            Some(user) => format!("Signed in as {}", user.label()),
            None => "Signed out".to_string(),
        };
        let mode = if self.offline { "Offline Mode" } else { "Online" };
        let header = Paragraph::new(format!(
            "StudyBuddy {} • {} • {}",
            config::APP_VERSION,
            who,
            mode
        ))
        .alignment(Alignment::Center)
        .style(Style::default().fg(theme.header).add_modifier(Modifier::BOLD));
        f.render_widget(header, chunks[0]);

        if self.active_pane == ActivePane::Auth {
            self.render_auth(f, chunks[1]);
        } else {
            self.render_workspace(f, chunks[1]);
        }

        match self.active_pane {
            ActivePane::DeleteConfirm => self.render_delete_confirm(f, chunks[1]),
            ActivePane::UploadPrompt => {
                let area = centered_rect(60, 20, f.area());
                let area = Rect { height: 3, ..area };
                f.render_widget(Clear, area);
                f.render_widget(&self.upload_input, area);
            }
            _ => {}
        }

        self.render_footer(f, chunks[2]);
    }

    fn render_workspace(&mut self, f: &mut Frame, area: Rect) {
        let theme = self.theme.clone();
        let main_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
            .split(area);

        let selected_index = self.list_state.selected();
        let items: Vec<ListItem> = self
            .state
            .notes
            .iter()
            .enumerate()
            .map(|(i, n)| note_item(n, Some(i) == selected_index, &theme))
            .collect();

        let list_border = if self.active_pane == ActivePane::List {
            theme.border_active
        } else {
            theme.border_inactive
        };
        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" Notes ({}) ", self.state.notes.len()))
                    .border_style(Style::default().fg(list_border)),
            )
            .highlight_style(
                Style::default()
                    .bg(theme.selection_bg)
                    .fg(theme.selection_fg)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol(">>");
        f.render_stateful_widget(list, main_chunks[0], &mut self.list_state);

        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(5),
                Constraint::Length(8),
            ])
            .split(main_chunks[1]);

        let editing = self.active_pane == ActivePane::Editor;
        let stale = self.state.selected_id.is_some() && self.state.selected().is_none();
        for (field, title) in [(EditorField::Title, " Title "), (EditorField::Content, " Content ")] {
            let focused = editing && self.field == field;
            let title = if stale && field == EditorField::Title {
                " Title (note no longer available) "
            } else {
                title
            };
            let block = Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(if focused {
                    theme.border_active
                } else {
                    theme.border_inactive
                }));
            let cursor = if focused {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            let area = match field {
                EditorField::Title => &mut self.title_area,
                EditorField::Content => &mut self.content_area,
            };
            area.set_block(block);
            area.set_cursor_style(cursor);
            area.set_cursor_line_style(Style::default());
            area.set_style(Style::default().fg(theme.foreground));
        }
        f.render_widget(&self.title_area, right[0]);
        f.render_widget(&self.content_area, right[1]);

        self.render_details(f, right[2]);
    }

    fn render_details(&self, f: &mut Frame, area: Rect) {
        let theme = &self.theme;
        let mut lines = Vec::new();
        match self.state.selected() {
            Some(note) => {
                match note.ai_summary.as_deref() {
                    Some(summary) => lines.extend(
                        summary
                            .lines()
                            .map(|l| Line::from(Span::styled(l.to_string(), Style::default().fg(theme.summary)))),
                    ),
                    None => lines.push(Line::from(Span::styled(
                        "No summary yet",
                        Style::default().fg(theme.hint),
                    ))),
                }
                if let Some(url) = &note.file_url {
                    lines.push(Line::from(""));
                    lines.push(Line::from(vec![
                        Span::raw("📎 "),
                        Span::styled(
                            url.clone(),
                            Style::default()
                                .fg(theme.link)
                                .add_modifier(Modifier::UNDERLINED),
                        ),
                    ]));
                }
            }
            None => lines.push(Line::from(Span::styled(
                "Select or create a note",
                Style::default().fg(theme.hint),
            ))),
        }
        let p = Paragraph::new(lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" AI Summary ")
                    .border_style(Style::default().fg(theme.border_inactive)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(p, area);
    }

    fn render_auth(&self, f: &mut Frame, area: Rect) {
        let theme = &self.theme;
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Sign in ")
            .border_style(Style::default().fg(theme.border_active));

        let card = centered_rect(60, 50, area);
        f.render_widget(Clear, card);

        let inner = block.inner(card);
        f.render_widget(block, card);
        let parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(3)])
            .split(inner);

        let text = if self.state.captcha_loading {
            format!("\n{} Verifying reCAPTCHA...", SPINNER[self.spinner_index])
        } else if self.state.captcha_ok {
            "\nreCAPTCHA passed.\n\n[g] Sign in with Google    [h] Sign in with GitHub".to_string()
        } else {
            let mut prompt =
                "\nComplete the reCAPTCHA challenge, then paste the token below\nand press [Enter].".to_string();
            if let Some(key) = &self.captcha_site_key {
                prompt.push_str(&format!("\n\nSite key: {}", key));
            }
            prompt
        };
        f.render_widget(
            Paragraph::new(text)
                .alignment(Alignment::Center)
                .style(Style::default().fg(theme.foreground))
                .wrap(Wrap { trim: false }),
            parts[0],
        );
        if !self.state.captcha_ok && !self.state.captcha_loading {
            f.render_widget(&self.captcha_input, parts[1]);
        }
    }

    fn render_delete_confirm(&self, f: &mut Frame, area: Rect) {
        let theme = &self.theme;
        let title = self
            .state
            .selected()
            .map(|n| sanitize_title(n.display_title()))
            .unwrap_or_default();
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Delete Note? ")
            .border_style(Style::default().fg(theme.status_error));
        let text = format!(
            "\n  Are you sure you want to delete this note?\n\n  \"{}\"\n\n  (y/n)",
            title
        );
        let p = Paragraph::new(text).block(block).alignment(Alignment::Center);

        let confirm_area = centered_rect(40, 30, area);
        f.render_widget(Clear, confirm_area);
        f.render_widget(p, confirm_area);
    }

    fn render_footer(&self, f: &mut Frame, area: Rect) {
        let theme = &self.theme;
        let (status, color) = if self.state.busy {
            (format!(" {} Working... ", SPINNER[self.spinner_index]), theme.busy)
        } else if let Some(notice) = &self.notice {
            (format!(" {} ", notice), theme.status_error)
        } else if self.state.status.starts_with('❌') {
            (format!(" {} ", self.state.status), theme.status_error)
        } else {
            (format!(" {} ", self.state.status), theme.status_ok)
        };

        let help = match self.active_pane {
            ActivePane::Auth if self.state.captcha_ok => " g: Google  •  h: GitHub  •  q: Quit ",
            ActivePane::Auth => " Enter: Verify  •  Esc: Quit ",
            ActivePane::List => {
                " j/k: Move  •  Enter: Edit  •  n: New  •  Ctrl+S: Save  •  d: Delete  •  s: Summarize  •  u: Attach  •  o: Open file  •  L: Logout  •  q: Quit "
            }
            ActivePane::Editor => " Tab: Title/Content  •  Ctrl+S: Save  •  Esc: Back ",
            ActivePane::DeleteConfirm => " y: Confirm  •  n: Cancel ",
            ActivePane::UploadPrompt => " Enter: Upload  •  Esc: Cancel ",
        };

        let footer = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Length(1)])
            .split(area);
        f.render_widget(
            Paragraph::new(status).style(Style::default().fg(color).add_modifier(Modifier::BOLD)),
            footer[0],
        );
        f.render_widget(
            Paragraph::new(help).style(Style::default().fg(theme.hint)),
            footer[1],
        );
    }
}

fn note_item(note: &Note, is_selected: bool, theme: &ThemeConfig) -> ListItem<'static> {
    let title = sanitize_title(note.display_title());
    let date_str = note
        .updated_at
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "saving...".to_string());
    let marker = if note.file_url.is_some() { " 📎" } else { "" };

    let date_line = if is_selected {
        Line::from(format!("    Updated: {}", date_str))
    } else {
        Line::from(Span::styled(
            format!("    Updated: {}", date_str),
            Style::default().fg(theme.hint),
        ))
    };
    ListItem::new(vec![Line::from(format!("   {}{}", title, marker)), date_line])
}

fn sanitize_title(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let result = sanitized.split_whitespace().collect::<Vec<_>>().join(" ");
    if result.is_empty() {
        "Untitled".to_string()
    } else {
        result
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
