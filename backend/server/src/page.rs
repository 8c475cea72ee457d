//! Response page shown on the checkpoint screen.
use axum::response::Html;

use crate::utils::escape_html;

pub const NOBODY: &str = "nobody";
pub const UNRECOGNIZED: &str = "I didn't recognize you (got no NFC-ID)";

pub fn render(user: &str, body: &str) -> Html<String> {
    let user = escape_html(user);
    let body = escape_html(body);

    Html(format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Tap</title>
  </head>
  <body>
    <h1>Hi {user}</h1>
    <p>{body}</p>
  </body>
</html>
"#
    ))
}
