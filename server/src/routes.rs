pub mod oauth;

use axum::extract::State;
use axum::{
    response::Redirect,
    routing::{get, post},
    Router,
};
use color_eyre::eyre::eyre;
use maud::{html, Markup, DOCTYPE};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthUser, OptionalUser};
use crate::errors::{ServerError, ServerResult, WithRedirect};
use crate::oauth::db;
use crate::state::AppState;

pub fn routes(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/login", get(login_page))
        .route("/me", get(me))
        .route("/oauth/login", post(oauth::login))
        .route("/oauth/callback", get(oauth::callback))
        .route("/oauth/client-metadata.json", get(oauth::client_metadata))
        .route("/oauth/logout", get(oauth::logout))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

fn page(title: &str, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                title { (title) " - Bibliome" }
            }
            body {
                main {
                    (body)
                }
            }
        }
    }
}

pub fn error_page(message: &str) -> Markup {
    page(
        "Something went wrong",
        html! {
            h1 { "Something went wrong" }
            p { (message) }
            p { a href="/login" { "Back to login" } }
        },
    )
}

async fn home(user: OptionalUser) -> Markup {
    page(
        "Welcome",
        html! {
            h1 { "Bibliome" }
            @if user.0.is_some() {
                p { a href="/me" { "Your account" } }
                p { a href="/oauth/logout" { "Log out" } }
            } @else {
                p { a href="/login" { "Log in with your atproto account" } }
            }
        },
    )
}

async fn login_page() -> Markup {
    page(
        "Log in",
        html! {
            h1 { "Log in" }
            form method="post" action="/oauth/login" {
                label for="identifier" { "Handle or DID" }
                input type="text" id="identifier" name="identifier"
                    placeholder="alice.bsky.social" required;
                button type="submit" { "Continue" }
            }
        },
    )
}

async fn me(State(state): State<AppState>, user: AuthUser) -> ServerResult<Markup, Redirect> {
    let session = db::get_session(&state, &user.did)
        .await
        .with_redirect(Redirect::to("/login"))?;

    let Some(session) = session else {
        // A browser session can outlive its oauth session; send them back
        // through login rather than rendering a half-empty page.
        return Err(ServerError(
            eyre!("browser session for {} has no oauth session", user.did),
            Redirect::to("/login"),
        ));
    };

    Ok(page(
        "Your account",
        html! {
            h1 { "Your account" }
            dl {
                dt { "Handle" }
                dd { "@" (session.handle) }
                dt { "DID" }
                dd { code { (session.did) } }
                dt { "PDS" }
                dd { (session.pds_url) }
            }
            p { a href="/oauth/logout" { "Log out" } }
        },
    ))
}
