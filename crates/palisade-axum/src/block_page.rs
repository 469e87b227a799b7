//! Static 403 block page.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>403 - Access Forbidden</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }

        :root {
            --accent: #2f6f4f;
            --accent-light: #4c9b72;
            --bg: #0c1210;
            --bg-panel: #141d19;
            --text: #eef4f0;
            --text-dim: #8fa59a;
        }

        body {
            font-family: system-ui, -apple-system, "Segoe UI", sans-serif;
            background: radial-gradient(ellipse at top, var(--bg-panel) 0%, var(--bg) 70%);
            color: var(--text);
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
        }

        .container {
            text-align: center;
            padding: 2rem;
        }

        .error-code {
            font-size: 6rem;
            font-weight: 700;
            letter-spacing: -0.02em;
            background: linear-gradient(135deg, var(--accent) 0%, var(--accent-light) 100%);
            -webkit-background-clip: text;
            -webkit-text-fill-color: transparent;
            background-clip: text;
            margin-bottom: 0.5rem;
        }

        h1 {
            font-size: 2rem;
            font-weight: 600;
            margin-bottom: 1rem;
        }

        .message {
            font-size: 1.125rem;
            color: var(--text-dim);
            line-height: 1.6;
            max-width: 480px;
            margin: 0 auto 2rem;
        }

        .divider {
            width: 64px;
            height: 3px;
            margin: 0 auto 2rem;
            border-radius: 2px;
            background: linear-gradient(90deg, var(--accent), var(--accent-light));
        }

        .footer {
            font-size: 0.875rem;
            color: var(--text-dim);
        }

        .footer span { color: var(--accent-light); font-weight: 500; }

        @media (max-width: 768px) {
            .error-code { font-size: 4rem; }
            h1 { font-size: 1.5rem; }
            .message { font-size: 1rem; }
        }
    </style>
</head>
<body>
    <div class="container">
        <div class="error-code">403</div>
        <h1>Forbidden</h1>
        <div class="divider"></div>
        <p class="message">Access to this resource is denied.</p>
        <div class="footer">Protected by <span>Palisade</span></div>
    </div>
</body>
</html>"#;

/// Builds the fixed 403 response served for blocked requests.
#[must_use]
pub fn block_page_response() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        BLOCK_PAGE_HTML,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_page_contract() {
        let response = block_page_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("403"));
        assert!(html.contains("Forbidden"));
    }
}
