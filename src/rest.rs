// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! HTTP file API over the workspace store.
//!
//! Every path argument flows through the store's path-escape check; the
//! handlers only translate between HTTP and [`WorkspaceError`].

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::WorkspaceError;
use crate::server::AppState;
use crate::workspace::infer_language_id;

/// The REST routes mounted next to `/lsp`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/files", get(list_files))
        .route("/api/file/*path", get(read_file).post(create_file))
        .route("/api/path/*path", delete(delete_path))
        .route("/api/folder/*path", post(create_folder))
        .route("/api/rename", put(rename_path))
}

type RestError = (StatusCode, Json<Value>);

fn reply_error(e: &WorkspaceError) -> RestError {
    let status = match e {
        WorkspaceError::Security(_) => StatusCode::FORBIDDEN,
        WorkspaceError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkspaceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "workspace": state.workspace.root().to_string_lossy(),
    }))
}

async fn list_files(State(state): State<Arc<AppState>>) -> Result<Json<Value>, RestError> {
    let tree = state
        .workspace
        .list_tree("")
        .await
        .map_err(|e| reply_error(&e))?;
    Ok(Json(json!({ "files": tree })))
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, RestError> {
    let content = state
        .workspace
        .read_file(&format!("file:///{path}"))
        .await
        .map_err(|e| reply_error(&e))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content.text,
    ))
}

async fn create_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), RestError> {
    let language_id = infer_language_id(std::path::Path::new(&path));
    state
        .workspace
        .create_file(&format!("file:///{path}"), &body, language_id)
        .await
        .map_err(|e| reply_error(&e))?;

    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "path": path }))))
}

async fn delete_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<Value>, RestError> {
    state
        .workspace
        .delete_path(&path)
        .await
        .map_err(|e| reply_error(&e))?;
    Ok(Json(json!({ "ok": true })))
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<(StatusCode, Json<Value>), RestError> {
    state
        .workspace
        .create_directory(&path)
        .await
        .map_err(|e| reply_error(&e))?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "path": path }))))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    #[serde(rename = "oldPath")]
    old_path: String,
    #[serde(rename = "newPath")]
    new_path: String,
}

async fn rename_path(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Value>, RestError> {
    state
        .workspace
        .rename_path(&request.old_path, &request.new_path)
        .await
        .map_err(|e| reply_error(&e))?;
    Ok(Json(json!({ "ok": true })))
}
