use std::sync::Arc;

use salvo::http::Method;
use salvo::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector::MattermostConnector;
use crate::error::BridgeError;
use crate::ingest::{ConnectionState, WebSocketListener};
use crate::matrix::RelayProvider;
use crate::matrix_admin::{JoinRule, MatrixAdmin, generate_matrix_user_id, server_of};
use crate::mattermost::models::{Channel, NewChannel, NewPost};
use crate::portal::{ConversationKind, Portal, PortalKey};
use crate::runtime::BridgeRuntime;
use crate::web::handlers::{render_error, web_state};
use crate::web::metrics::Metrics;

const MAX_CHANNEL_NAME: usize = 64;
const MAX_LISTED_ROOMS: usize = 25;

const HELP: &str = "**Matrix Bridge Commands**

• `/matrix help` - Show this help message
• `/matrix status` - Show bridge status
• `/matrix me` - Show your Matrix user info
• `/matrix join <room>` - Join a Matrix room (e.g., `#room:matrix.org`)
• `/matrix dm <user>` - Start a DM with a Matrix user (e.g., `@user:matrix.org`)
• `/matrix rooms` - List bridged Matrix rooms
• `/matrix account` - Get your Matrix account credentials";

/// Form fields Mattermost posts for a slash command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    pub channel_id: String,
    pub channel_name: String,
    pub command: String,
    pub team_domain: String,
    pub team_id: String,
    pub text: String,
    pub token: String,
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub response_type: &'static str,
    pub text: String,
}

impl CommandResponse {
    fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: "ephemeral",
            text: text.into(),
        }
    }
}

/// Maps a room alias or ID to a Mattermost channel name: `mx_` prefix, lowercase, at most
/// 64 characters.
pub fn sanitize_channel_name(room: &str) -> String {
    let name = room.trim_start_matches('#').trim_start_matches('!');
    let name = name.replace([':', '.'], "_").replace(' ', "-");
    let mut name = format!("mx_{name}").to_lowercase();
    if name.len() > MAX_CHANNEL_NAME {
        let mut end = MAX_CHANNEL_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

pub struct SlashCommands {
    config: Arc<Config>,
    connector: Arc<MattermostConnector>,
    runtime: Arc<dyn BridgeRuntime>,
    admin: Option<Arc<MatrixAdmin>>,
    listener: Option<Arc<WebSocketListener>>,
}

impl SlashCommands {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<MattermostConnector>,
        runtime: Arc<dyn BridgeRuntime>,
        admin: Option<Arc<MatrixAdmin>>,
        listener: Option<Arc<WebSocketListener>>,
    ) -> Self {
        Self {
            config,
            connector,
            runtime,
            admin,
            listener,
        }
    }

    /// Checks the shared token when one is configured.
    pub fn authorize(&self, token: &str) -> bool {
        match self.config.mattermost.slash_command_token.as_deref() {
            Some(expected) if !expected.is_empty() => token == expected,
            _ => true,
        }
    }

    pub async fn execute(&self, request: &CommandRequest) -> CommandResponse {
        Metrics::slash_command();
        let mut parts = request.text.split_whitespace();
        let Some(subcommand) = parts.next() else {
            return CommandResponse::ephemeral(HELP);
        };
        let subcommand = subcommand.to_lowercase();
        let args: Vec<&str> = parts.collect();
        debug!(user_id = %request.user_id, subcommand, "slash command");

        match subcommand.as_str() {
            "help" => CommandResponse::ephemeral(HELP),
            "status" => self.status().await,
            "me" => self.me(request),
            "join" => self.join(request, &args).await,
            "dm" => self.dm(request, &args).await,
            "rooms" => self.rooms().await,
            "account" => self.account(request).await,
            other => CommandResponse::ephemeral(format!(
                "Unknown subcommand: `{other}`. Use `/matrix help` for available commands."
            )),
        }
    }

    async fn status(&self) -> CommandResponse {
        let websocket = match self.listener.as_ref().map(|l| l.state()) {
            Some(ConnectionState::Listening) => "Connected",
            Some(ConnectionState::Connecting) => "Connecting",
            Some(ConnectionState::Disconnected) | None => "Not connected",
        };
        let portals = match self.runtime.list_portals().await {
            Ok(portals) => portals.iter().filter(|p| p.mxid.is_some()).count().to_string(),
            Err(err) => {
                warn!(error = %err, "failed to count portals");
                "unknown".to_string()
            }
        };
        CommandResponse::ephemeral(
            [
                "**Matrix Bridge Status**".to_string(),
                String::new(),
                format!("• **Mattermost**: {}", self.config.mattermost.server_url),
                format!("• **WebSocket**: {websocket}"),
                format!("• **Mode**: {}", self.config.mattermost.mode),
                format!("• **Logged-in users**: {}", self.connector.sessions().len()),
                format!("• **Bridged rooms**: {portals}"),
            ]
            .join("\n"),
        )
    }

    fn me(&self, request: &CommandRequest) -> CommandResponse {
        let sessions = self.connector.sessions();
        if let Some(session) = sessions.find_by_mm_user(&request.user_id) {
            return CommandResponse::ephemeral(format!(
                "**Your Matrix Info**\n\n• **Username**: `{}`\n• **Matrix ID**: `{}`\n• **Status**: ✅ Connected",
                session.mm_username, session.matrix_user_id
            ));
        }
        match sessions.first() {
            Some(shared) => CommandResponse::ephemeral(format!(
                "**Your Matrix Info**\n\n• **Username**: `{}`\n• **Relayed through**: `{}`\n\nYou have no login of your own; the bridge relays your messages through a shared account.",
                request.user_name, shared.matrix_user_id
            )),
            None => CommandResponse::ephemeral(
                "No Matrix login found. The bridge may be using a shared admin account.",
            ),
        }
    }

    async fn join(&self, request: &CommandRequest, args: &[&str]) -> CommandResponse {
        let Some(&room) = args.first() else {
            return CommandResponse::ephemeral(
                "Usage: `/matrix join <room>` - e.g., `/matrix join #test:matrix.org`",
            );
        };
        if !room.starts_with('#') && !room.starts_with('!') {
            return CommandResponse::ephemeral(
                "Invalid room identifier. Use a room alias (e.g., `#room:server.com`) or room ID (e.g., `!abc123:server.com`).",
            );
        }
        let Some(admin) = &self.admin else {
            return CommandResponse::ephemeral(
                "❌ Synapse Admin API is not configured. Contact your administrator to enable this feature.",
            );
        };
        let Some(login) = self.connector.sessions().first() else {
            return CommandResponse::ephemeral(
                "❌ No bridge logins available. The bridge may not be fully configured.",
            );
        };
        let mm = login.client();

        let user = match mm.get_user(&request.user_id).await {
            Ok(user) => user,
            Err(err) => {
                warn!(user_id = %request.user_id, error = %err, "failed to look up command user");
                return CommandResponse::ephemeral("❌ Failed to get your Mattermost user info.");
            }
        };
        let matrix_user_id = generate_matrix_user_id(&user.username, &self.config.bridge.domain);
        if let Err(err) = admin
            .provision_account_if_absent(&matrix_user_id, &user.display_name())
            .await
        {
            warn!(matrix_user_id, error = %err, "could not ensure matrix account, joining anyway");
        }

        let (room_id, via) = if room.starts_with('#') {
            match admin.resolve_alias(room).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(room, error = %err, "alias resolution failed");
                    return CommandResponse::ephemeral(format!(
                        "❌ Failed to resolve room alias `{room}`. Make sure the room exists and is accessible."
                    ));
                }
            }
        } else {
            let via = server_of(room).map(|s| vec![s.to_string()]).unwrap_or_default();
            (room.to_string(), via)
        };
        let public = match admin.room_join_rule(&room_id).await {
            Ok(rule) => rule == JoinRule::Public,
            Err(err) => {
                debug!(room_id, error = %err, "join rule unavailable, assuming public");
                true
            }
        };

        let bot = format!(
            "@{}:{}",
            self.config.registration.sender_localpart, self.config.bridge.domain
        );
        if let Err(err) = admin.join_as_identity(&bot, &room_id, &via).await {
            warn!(room_id, error = %err, "bridge bot could not join");
            return CommandResponse::ephemeral(
                "❌ Failed to join Matrix room. The room may be invite-only.",
            );
        }
        if let Err(err) = admin.join_as_identity(&matrix_user_id, &room_id, &via).await {
            debug!(matrix_user_id, error = %err, "impersonated join failed, trying admin join");
            if let Err(err) = admin.admin_join(&matrix_user_id, &room_id).await {
                warn!(matrix_user_id, room_id, error = %err, "user could not join");
            }
        }

        let teams = match mm.get_teams_for_user(&request.user_id).await {
            Ok(teams) => teams,
            Err(err) => {
                warn!(error = %err, "failed to list teams");
                Vec::new()
            }
        };
        let Some(team) = teams.into_iter().next() else {
            return CommandResponse::ephemeral(
                "❌ Could not find a team to create the channel in. Make sure you're a member of at least one team.",
            );
        };

        let name = sanitize_channel_name(room);
        let new_channel = NewChannel {
            team_id: team.id.clone(),
            channel_type: if public { "O" } else { "P" }.to_string(),
            name: name.clone(),
            display_name: format!("Matrix: {room}"),
            purpose: format!("Bridged from Matrix room {room_id}"),
        };
        let channel: Channel = match mm.create_channel(&new_channel).await {
            Ok(channel) => channel,
            Err(create_err) => match mm.get_channel_by_name(&team.id, &name).await {
                Ok(channel) => channel,
                Err(_) => {
                    warn!(name, error = %create_err, "failed to create channel");
                    return CommandResponse::ephemeral("❌ Failed to create Mattermost channel.");
                }
            },
        };
        if let Err(err) = mm.add_channel_member(&channel.id, &request.user_id).await
            && !err.is_already_member()
        {
            debug!(channel_id = %channel.id, error = %err, "could not add user to channel");
        }

        let key = PortalKey::new(channel.id.clone());
        let kind = if public {
            ConversationKind::Open
        } else {
            ConversationKind::Private
        };
        let portal = match self.runtime.get_portal(&key).await {
            Ok(portal) => portal,
            Err(err) => {
                warn!(portal = %key, error = %err, "portal lookup failed");
                return CommandResponse::ephemeral(
                    "✅ Joined Matrix room and created channel, but failed to set up the portal.",
                );
            }
        };
        let mut portal = portal.unwrap_or_else(|| Portal::new(key.clone(), kind));
        portal.mxid.get_or_insert_with(|| room_id.clone());
        portal.name.get_or_insert_with(|| new_channel.display_name.clone());
        portal.parent = Some(PortalKey::new(team.id.clone()));
        portal.relay_login_id = Some(login.id.clone());
        if let Err(err) = self.runtime.save_portal(&portal).await {
            warn!(portal = %key, error = %err, "failed to save portal");
            return CommandResponse::ephemeral(
                "✅ Joined Matrix room and created channel, but failed to set up the portal.",
            );
        }
        info!(room_id, channel_id = %channel.id, "bridged matrix room by command");

        CommandResponse::ephemeral(format!(
            "✅ **Successfully joined Matrix room!**\n\n• **Matrix Room**: `{room_id}`\n• **Matrix Account**: `{matrix_user_id}`\n• **Mattermost Channel**: `{}` ({})\n• **[Open Channel](/{}/channels/{})**\n\nMessages will now be bridged between the Matrix room and this Mattermost channel.",
            channel.display_name,
            if public { "public" } else { "private" },
            team.name,
            channel.name
        ))
    }

    async fn dm(&self, request: &CommandRequest, args: &[&str]) -> CommandResponse {
        let Some(&matrix_user_id) = args.first() else {
            return CommandResponse::ephemeral(
                "Usage: `/matrix dm <user>` - e.g., `/matrix dm @alice:matrix.org`",
            );
        };
        if !matrix_user_id.starts_with('@') || !matrix_user_id.contains(':') {
            return CommandResponse::ephemeral("Invalid Matrix user ID. Use the format `@user:server.com`.");
        }
        let Some(relay) = self.connector.relay_for(None) else {
            return CommandResponse::ephemeral(
                "❌ No bridge logins available. The bridge may not be fully configured.",
            );
        };

        let resolved = match relay.resolve_identifier(matrix_user_id, true).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(matrix_user_id, error = %err, "failed to open direct chat");
                let text = match err {
                    BridgeError::NotFound(_) | BridgeError::Ambiguous(_) => {
                        format!("❌ Could not find `{matrix_user_id}`.")
                    }
                    _ => "❌ Failed to create DM channel.".to_string(),
                };
                return CommandResponse::ephemeral(text);
            }
        };
        let Some(chat) = resolved.chat else {
            return CommandResponse::ephemeral("❌ Failed to create DM channel.");
        };

        let starter = NewPost {
            channel_id: chat.channel_id.clone(),
            message: format!(
                "Bridged DM with `{matrix_user_id}` established. You can now chat with this user."
            ),
            ..Default::default()
        };
        if let Err(err) = relay.login().client().create_post(&starter).await {
            debug!(channel_id = %chat.channel_id, error = %err, "failed to post starter message");
        }

        CommandResponse::ephemeral(format!(
            "✅ **DM created with Matrix user!**\n\n• **Matrix User**: `{matrix_user_id}`\n• **Channel ID**: `{}`\n• **[Open Direct Message](/{}/channels/{})**\n\nA starter message has been posted to ensure the channel appears in your sidebar.",
            chat.channel_id, request.team_domain, chat.channel_id
        ))
    }

    async fn rooms(&self) -> CommandResponse {
        let portals = match self.runtime.list_portals().await {
            Ok(portals) => portals,
            Err(err) => {
                warn!(error = %err, "failed to list portals");
                return CommandResponse::ephemeral("❌ Failed to list bridged rooms.");
            }
        };
        let mut bridged: Vec<&Portal> = portals
            .iter()
            .filter(|p| p.mxid.is_some() && p.kind != ConversationKind::Team)
            .collect();
        if bridged.is_empty() {
            return CommandResponse::ephemeral(
                "**Bridged Matrix Rooms**\n\n_No rooms are currently bridged._\n\n_Use `/matrix join <room>` to bridge a Matrix room._",
            );
        }
        bridged.sort_by(|a, b| a.name.cmp(&b.name));

        let mut lines = vec!["**Bridged Matrix Rooms**".to_string(), String::new()];
        for portal in bridged.iter().take(MAX_LISTED_ROOMS) {
            lines.push(format!(
                "• {} ({}) → `{}`",
                portal.name.as_deref().unwrap_or(&portal.key.id),
                portal.kind,
                portal.mxid.as_deref().unwrap_or_default()
            ));
        }
        if bridged.len() > MAX_LISTED_ROOMS {
            lines.push(format!("_…and {} more_", bridged.len() - MAX_LISTED_ROOMS));
        }
        CommandResponse::ephemeral(lines.join("\n"))
    }

    async fn account(&self, request: &CommandRequest) -> CommandResponse {
        let domain = &self.config.bridge.domain;
        let matrix_user_id = generate_matrix_user_id(&request.user_name, domain);
        let Some(admin) = &self.admin else {
            return CommandResponse::ephemeral(format!(
                "**Your Matrix Account**\n\n• **Matrix ID**: `{matrix_user_id}`\n• **Homeserver**: `{domain}`\n\n_Note: Synapse Admin API is not configured. Contact your administrator for login credentials._"
            ));
        };

        let display_name = match self.connector.sessions().first() {
            Some(login) => match login.client().get_user(&request.user_id).await {
                Ok(user) => user.display_name(),
                Err(_) => request.user_name.clone(),
            },
            None => request.user_name.clone(),
        };
        match admin
            .provision_account_if_absent(&matrix_user_id, &display_name)
            .await
        {
            Ok(None) => CommandResponse::ephemeral(format!(
                "**Your Matrix Account**\n\n• **Matrix ID**: `{matrix_user_id}`\n• **Homeserver**: `{domain}`\n• **Status**: ✅ Account exists\n\nYou can log in to any Matrix client using your Matrix ID.\n\n_If you need to reset your password, contact your administrator._"
            )),
            Ok(Some(password)) => CommandResponse::ephemeral(format!(
                "✅ **Matrix Account Created!**\n\n• **Matrix ID**: `{matrix_user_id}`\n• **Homeserver**: `{domain}`\n• **Password**: `{password}`\n\n⚠️ **Save this password!** It will not be shown again."
            )),
            Err(err) => {
                warn!(matrix_user_id, error = %err, "account provisioning failed");
                CommandResponse::ephemeral("❌ Failed to set up your Matrix account.")
            }
        }
    }
}

#[handler]
pub async fn command(req: &mut Request, res: &mut Response) {
    if req.method() != Method::POST {
        render_error(res, StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        return;
    }
    let request = match req.parse_form::<CommandRequest>().await {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "malformed slash command form");
            render_error(res, StatusCode::BAD_REQUEST, "bad request");
            return;
        }
    };
    let commands = &web_state().commands;
    if !commands.authorize(&request.token) {
        render_error(res, StatusCode::UNAUTHORIZED, "unauthorized");
        return;
    }
    res.render(Json(commands.execute(&request).await));
}
