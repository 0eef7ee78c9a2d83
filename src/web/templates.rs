//! HTML pages.

use maud::{html, Markup, DOCTYPE};

use crate::handlers::raw::{RawOption, OPTION_PREFIX, RAW_OPTIONS};

const PAGE_STYLE: &str = r"
body {
    font-family: system-ui, sans-serif;
    max-width: 40rem;
    margin: 3rem auto;
    padding: 0 1rem;
    line-height: 1.4;
}
input {
    box-sizing: border-box;
    padding: 0.4em;
}
.description {
    display: block;
    font-size: 0.75em;
    margin-top: 0.5em;
    opacity: 0.75;
}
";

fn layout(title: &str, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                meta name="color-scheme" content="light dark";
                title { (title) }
                style { (PAGE_STYLE) }
            }
            body {
                main { (content) }
            }
        }
    }
}

/// Landing page with the post URL form.
#[must_use]
pub fn render_home() -> Markup {
    layout(
        "Twitshot",
        html! {
            h1 { "Twitshot" }
            p {
                "Screenshot a post from X/Twitter, Mastodon, Misskey, Tumblr, Bluesky or LinkedIn. "
                "You can also prepend this site's address to the post URL, eg. "
                code { "/https://x.com/username/status/1234567890" }
                "."
            }
            form method="post" action="/" {
                p {
                    label {
                        "Post URL:"
                        br;
                        input type="url" name="url" required
                            placeholder="https://x.com/username/status/1234567890"
                            style="width: 100%";
                    }
                }
                button type="submit" { "Screenshot" }
            }
        },
    )
}

fn option_input(option: &RawOption) -> Markup {
    let description_id = format!("_{}-description", option.name);
    let placeholder = option
        .placeholder
        .unwrap_or("element#with-an-id.and-a-class-name");
    html! {
        p {
            label {
                (option.title) ":"
                br;
                @if let Some(limits) = option.number {
                    input type="number"
                        name=(format!("{OPTION_PREFIX}{}", option.name))
                        placeholder=(placeholder)
                        min=(limits.min)
                        max=(limits.max)
                        step=(limits.step)
                        aria-describedby=(description_id)
                        style="width: 100%";
                } @else {
                    input type="text"
                        name=(format!("{OPTION_PREFIX}{}", option.name))
                        placeholder=(placeholder)
                        aria-describedby=(description_id)
                        style="width: 100%";
                }
            }
            span.description id=(description_id) { (option.description) }
        }
    }
}

/// Raw screenshot form listing every option.
#[must_use]
pub fn render_raw_home() -> Markup {
    layout(
        "Twitshot - raw",
        html! {
            h1 { "Raw screenshot" }
            p { "Screenshot any public page. Optional fields tune what ends up in the image." }
            form method="post" action="/raw" {
                p {
                    label {
                        "Page URL:"
                        br;
                        input type="url" name="url" required
                            placeholder="https://example.com/"
                            style="width: 100%";
                    }
                }
                @for option in RAW_OPTIONS {
                    (option_input(option))
                }
                button type="submit" { "Screenshot" }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_has_form() {
        let html = render_home().into_string();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains(r#"<form method="post" action="/">"#));
        assert!(html.contains(r#"name="url""#));
    }

    #[test]
    fn test_raw_home_lists_options() {
        let html = render_raw_home().into_string();
        for option in RAW_OPTIONS {
            assert!(html.contains(&format!("name=\"$${}\"", option.name)), "{}", option.name);
            assert!(html.contains(option.title));
        }
        assert!(html.contains(r#"min="100""#));
        assert!(html.contains(r#"max="3000""#));
        assert!(html.contains(r#"step="0.5""#));
    }
}
