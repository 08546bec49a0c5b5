//! Server-rendered pages.
//!
//! Three templates, compiled into the binary: the landing page, the player
//! page and a generic error page. The HTTP layer only ever sees rendered
//! strings, so the template engine stays swappable.

use minijinja::Environment;
use serde::Serialize;

use crate::helpers::Commit;

#[derive(Debug, Serialize)]
pub struct HomePage {
    pub app_name: String,
    pub bot_link: String,
    pub channel_link: String,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Serialize)]
pub struct WatchPage {
    pub app_name: String,
    pub title: String,
    pub size: String,
    pub stream_link: String,
    pub download_link: String,
    pub just_verified: bool,
    pub expire_time: String,
}

pub struct Pages {
    env: Environment<'static>,
}

impl Pages {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template("home", include_str!("../templates/home.html"))?;
        env.add_template("watch", include_str!("../templates/watch.html"))?;
        env.add_template("error", include_str!("../templates/error.html"))?;
        Ok(Self { env })
    }

    pub fn render_home(&self, page: &HomePage) -> Result<String, minijinja::Error> {
        self.env.get_template("home")?.render(page)
    }

    pub fn render_watch(&self, page: &WatchPage) -> Result<String, minijinja::Error> {
        self.env.get_template("watch")?.render(page)
    }

    pub fn render_error(&self, message: &str) -> Result<String, minijinja::Error> {
        self.env
            .get_template("error")?
            .render(minijinja::context! { error => message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_templates_compile_and_render() {
        let pages = Pages::new().unwrap();

        let home = pages
            .render_home(&HomePage {
                app_name: "Stream Gateway".to_string(),
                bot_link: "https://t.me/bot".to_string(),
                channel_link: "https://t.me/channel".to_string(),
                commits: vec![Commit {
                    date: "2025-06-01".to_string(),
                    message: "fix seek".to_string(),
                }],
            })
            .unwrap();
        assert!(home.contains("https://t.me/bot"));
        assert!(home.contains("fix seek"));

        let watch = pages
            .render_watch(&WatchPage {
                app_name: "Stream Gateway".to_string(),
                title: "movie.mp4".to_string(),
                size: "2.9 MB".to_string(),
                stream_link: "/stream/1/2/abc123".to_string(),
                download_link: "/stream/1/2/abc123?d=1".to_string(),
                just_verified: true,
                expire_time: "24h0m0s".to_string(),
            })
            .unwrap();
        assert!(watch.contains("movie.mp4"));
        assert!(watch.contains("/stream/1/2/abc123"));
        assert!(watch.contains("verified"));

        let error = pages.render_error("Invalid hash. Check your URL").unwrap();
        assert!(error.contains("Invalid hash"));
    }

    #[test]
    fn test_watch_page_escapes_file_names() {
        let pages = Pages::new().unwrap();
        let watch = pages
            .render_watch(&WatchPage {
                app_name: "Stream Gateway".to_string(),
                title: "<script>alert(1)</script>.mp4".to_string(),
                size: "1.0 MB".to_string(),
                stream_link: "/stream/1/2/abc123".to_string(),
                download_link: "/stream/1/2/abc123?d=1".to_string(),
                just_verified: false,
                expire_time: "24h0m0s".to_string(),
            })
            .unwrap();
        assert!(!watch.contains("<script>alert(1)</script>"));
    }
}
