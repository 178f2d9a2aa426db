//! Notification commands
//!
//! List, acknowledge and clear governor notifications.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use shopgauge_core::services::governor::{Notification, NotificationTopic};

use super::Context;
use crate::output::{print_json, print_output, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum NotificationsAction {
    /// List notifications, newest first
    List {
        /// Only unread notifications
        #[arg(long)]
        unread: bool,

        /// Only notifications under this topic (rate_limit, mutation, ...)
        #[arg(long)]
        topic: Option<String>,
    },

    /// Mark notifications as read
    Read {
        /// Notification ID
        id: Option<String>,

        /// Mark every notification as read
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Delete all notifications
    Clear,
}

/// Notification row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct NotificationRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Time")]
    pub time: String,
    #[tabled(rename = "Type")]
    pub kind: String,
    #[tabled(rename = "Topic")]
    pub topic: String,
    #[tabled(rename = "Message")]
    pub message: String,
    #[tabled(rename = "Read")]
    pub read: bool,
}

impl From<&Notification> for NotificationRow {
    fn from(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            time: notification.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            kind: notification.kind.to_string(),
            topic: notification.topic.to_string(),
            message: notification.message.clone(),
            read: notification.read,
        }
    }
}

pub async fn execute(ctx: &Context, action: NotificationsAction) -> Result<()> {
    match action {
        NotificationsAction::List { unread, topic } => list_notifications(ctx, unread, topic).await,
        NotificationsAction::Read { id, all } => mark_read(ctx, id, all).await,
        NotificationsAction::Clear => clear_notifications(ctx).await,
    }
}

async fn list_notifications(ctx: &Context, unread: bool, topic: Option<String>) -> Result<()> {
    let notifications = ctx.notifications().await;

    let mut items = match topic {
        Some(topic) => {
            notifications
                .get_by_topic(&NotificationTopic::from(topic))
                .await
        }
        None => notifications.get_all().await,
    };
    if unread {
        items.retain(|n| !n.read);
    }

    match ctx.format {
        OutputFormat::Json => print_json(&items),
        OutputFormat::Table => {
            let rows: Vec<NotificationRow> = items.iter().map(NotificationRow::from).collect();
            print_output(&rows, ctx.format)
        }
    }
}

async fn mark_read(ctx: &Context, id: Option<String>, all: bool) -> Result<()> {
    let notifications = ctx.notifications().await;

    if all {
        let count = notifications.mark_all_as_read().await;
        print_success(&format!("Marked {} notifications as read", count), ctx.quiet);
        return Ok(());
    }

    let Some(id) = id else {
        bail!("Specify a notification ID or --all");
    };

    if !notifications.mark_as_read(&id).await {
        bail!("Notification not found: {}", id);
    }
    print_success(&format!("Marked {} as read", id), ctx.quiet);
    Ok(())
}

async fn clear_notifications(ctx: &Context) -> Result<()> {
    let notifications = ctx.notifications().await;
    let count = notifications.get_all().await.len();
    notifications.clear().await;
    print_success(&format!("Cleared {} notifications", count), ctx.quiet);
    Ok(())
}
