use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use locaith::api::{AspectRatio, EffortLevel};
use locaith::config::ClientConfig;
use locaith::events::ProcessedEvent;
use locaith::session::SessionCoordinator;
use locaith::transcript::MessageRole;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,locaith=debug")),
        )
        .init();

    let config = ClientConfig::load();
    tracing::info!("Research backend: {}", config.base_url);

    let mut effort = config.effort;
    let mut coordinator = SessionCoordinator::new(config);
    let mut state = RenderState::default();

    println!("Locaith research client. Gõ câu hỏi, hoặc /help để xem lệnh.");
    println!("Phiên: {}", coordinator.session_id());
    prompt(effort, coordinator.is_loading());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&mut coordinator, &mut effort, &mut state, line.trim()).await {
                    break;
                }
                render(&mut coordinator, &mut state);
                prompt(effort, coordinator.is_loading());
            }
            changed = coordinator.wait_for_change() => {
                if changed {
                    render(&mut coordinator, &mut state);
                    prompt(effort, coordinator.is_loading());
                }
            }
        }
    }

    Ok(())
}

#[derive(Default)]
struct RenderState {
    printed_ids: HashSet<String>,
    printed_events: usize,
    preview_shown: bool,
    error_shown: bool,
    was_loading: bool,
}

impl RenderState {
    fn reset_for_turn(&mut self) {
        self.preview_shown = false;
        self.error_shown = false;
    }

    fn reset_for_session(&mut self) {
        self.printed_ids.clear();
        self.printed_events = 0;
        self.reset_for_turn();
    }
}

/// Returns false when the user asked to quit.
async fn handle_line(
    coordinator: &mut SessionCoordinator,
    effort: &mut EffortLevel,
    state: &mut RenderState,
    line: &str,
) -> bool {
    if line.is_empty() {
        return true;
    }

    let Some(rest) = line.strip_prefix('/') else {
        state.reset_for_turn();
        coordinator.submit_auto(line, *effort).await;
        return true;
    };

    let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "new" => {
            coordinator.new_session();
            state.reset_for_session();
            println!("Phiên mới: {}", coordinator.session_id());
        }
        "history" => {
            let sessions = coordinator.research_history();
            if sessions.is_empty() {
                println!("Chưa có phiên nghiên cứu nào.");
            }
            for session in sessions {
                println!(
                    "  {} | {} | {} sự kiện | {}",
                    session.session_id,
                    format_session_time(session.started_at),
                    session.events.len(),
                    session.summary
                );
            }
        }
        "restore" => {
            if coordinator.restore_session(args) {
                state.reset_for_session();
                println!("Đã khôi phục phiên {args}.");
            } else {
                println!("Không tìm thấy phiên {args}.");
            }
        }
        "delete" => {
            if coordinator.delete_session(args) {
                println!("Đã xóa phiên {args}.");
            } else {
                println!("Không tìm thấy phiên {args}.");
            }
        }
        "effort" => {
            match args {
                "low" => *effort = EffortLevel::Low,
                "medium" => *effort = EffortLevel::Medium,
                "high" => *effort = EffortLevel::High,
                _ => {}
            }
            println!("Mức nghiên cứu: {}", effort.as_str());
        }
        "image" => {
            if args.is_empty() {
                println!("Cách dùng: /image <mô tả ảnh>");
            } else {
                state.reset_for_turn();
                coordinator.generate_image(args, AspectRatio::default());
            }
        }
        "edit" => {
            let Some((path, prompt_text)) = args.split_once(' ') else {
                println!("Cách dùng: /edit <tệp ảnh> <mô tả chỉnh sửa>");
                return true;
            };
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let file_name = Path::new(path)
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or("image.png");
                    state.reset_for_turn();
                    coordinator.edit_image(
                        prompt_text.trim(),
                        AspectRatio::default(),
                        file_name,
                        bytes,
                    );
                }
                Err(error) => println!("Không đọc được tệp {path}: {error}"),
            }
        }
        "preview" => match coordinator.api().preview_metadata(args).await {
            Ok(Some(meta)) => {
                println!(
                    "  {} | {}",
                    meta.title.as_deref().unwrap_or("(không tiêu đề)"),
                    meta.image.as_deref().unwrap_or("(không ảnh)")
                );
                if let Some(description) = meta.description.as_deref() {
                    println!("  {description}");
                }
            }
            Ok(None) => println!("Không có xem trước cho liên kết này."),
            Err(error) => println!("Lỗi xem trước: {error:#}"),
        },
        "doc" => {
            let (title, content) = args.split_once('|').unwrap_or((args, ""));
            coordinator.request_document_preview(title.trim(), content.trim());
        }
        "cancel" => {
            coordinator.cancel();
            println!("Đã dừng.");
        }
        _ => println!("Lệnh không hợp lệ. Gõ /help."),
    }
    true
}

fn render(coordinator: &mut SessionCoordinator, state: &mut RenderState) {
    let events = coordinator.live_activity();
    if events.len() < state.printed_events {
        state.printed_events = 0;
    }
    for event in &events[state.printed_events..] {
        println!("  • [{}] {}", event.title, describe_event(event));
    }
    state.printed_events = events.len();

    if !state.preview_shown {
        if let Some(preview) = coordinator.streaming_preview() {
            println!("AI (bản nháp): {}", snippet(preview, 160));
            state.preview_shown = true;
        }
    }

    for message in coordinator.transcript() {
        if state.printed_ids.contains(&message.id) {
            continue;
        }
        let speaker = match message.role {
            MessageRole::Human => "Bạn",
            MessageRole::Ai => "AI",
        };
        println!("{speaker}: {}", message.content);
        state.printed_ids.insert(message.id.clone());
    }

    if !state.error_shown {
        if let Some(error) = coordinator.error() {
            println!("Lỗi: {error}");
            state.error_shown = true;
        }
    }

    for preview in coordinator.take_document_previews() {
        println!("--- Xem trước tài liệu: {} ---", preview.title);
        println!("{}", preview.content);
        println!("---");
    }

    if state.was_loading && !coordinator.is_loading() {
        if coordinator.error().is_none() && coordinator.used_search() {
            println!(
                "(nghiên cứu xong: {} sự kiện, {} nguồn)",
                coordinator.live_activity().len(),
                coordinator.gathered_sources().len()
            );
        }
        if let Some(plan) = coordinator.latest_plan() {
            println!("Kế hoạch: {}", snippet(&plan.to_string(), 160));
        }
    }
    state.was_loading = coordinator.is_loading();
}

fn prompt(effort: EffortLevel, loading: bool) {
    if loading {
        return;
    }
    print!("[{}] > ", effort.as_str());
    let _ = std::io::stdout().flush();
}

fn describe_event(event: &ProcessedEvent) -> String {
    match &event.data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn snippet(text: &str, limit: usize) -> String {
    let mut out: String = text.chars().take(limit).collect();
    if text.chars().count() > limit {
        out.push_str("...");
    }
    out
}

fn format_session_time(started_at: i64) -> String {
    chrono::DateTime::from_timestamp_millis(started_at)
        .map(|time| {
            time.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "?".to_string())
}

fn print_help() {
    println!("Lệnh:");
    println!("  /new                       phiên nghiên cứu mới");
    println!("  /history                   danh sách phiên đã lưu");
    println!("  /restore <id>              khôi phục hoạt động của một phiên");
    println!("  /delete <id>               xóa một phiên đã lưu");
    println!("  /effort low|medium|high    đặt mức nghiên cứu");
    println!("  /image <mô tả>             tạo ảnh");
    println!("  /edit <tệp> <mô tả>        chỉnh sửa ảnh từ tệp");
    println!("  /preview <url>             xem trước liên kết");
    println!("  /doc <tiêu đề>|<nội dung>  xem trước tài liệu");
    println!("  /cancel                    dừng lượt hiện tại");
    println!("  /quit                      thoát");
}
