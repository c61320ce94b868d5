use super::{lock, FailureSwitches, World};
use crate::engine::config::BrowserSettings;
use crate::platform::browser::{
    BrowserEnvironment, BrowserFactory, CompositionController, EnvironmentOptions, MouseInput,
    NavigationCompleted, NavigationCompletedHandler, WebMessageHandler,
};
use crate::platform::composition::VisualId;
use crate::platform::window::WindowId;
use crate::render::Viewport;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const BLANK: &str = "about:blank";
const POST_MESSAGE: &str = "window.chrome.webview.postMessage(";

/// Observable state of a software controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerRecord {
    pub settings: Option<BrowserSettings>,
    pub bounds: Viewport,
    pub visible: bool,
    pub root_visual: Option<VisualId>,
    pub mouse_inputs: Vec<MouseInput>,
    pub scripts: Vec<String>,
    /// Urls in the order their navigation completed
    pub completed: Vec<String>,
    pub closed: bool,
}

/// Session history of a controller.
///
/// The `about:blank` document loaded into an empty history is a placeholder: the next
/// committed page replaces it instead of stacking on top of it.
#[derive(Debug, Default)]
struct History {
    entries: Vec<String>,
    index: usize,
    placeholder: bool,
}

impl History {
    fn commit(&mut self, url: &str, may_be_placeholder: bool) {
        if self.entries.is_empty() {
            self.entries.push(url.to_string());
            self.index = 0;
            self.placeholder = may_be_placeholder && url == BLANK;
            return;
        }
        if self.placeholder {
            self.entries[0] = url.to_string();
            self.placeholder = false;
            return;
        }
        self.entries.truncate(self.index + 1);
        self.entries.push(url.to_string());
        self.index = self.entries.len() - 1;
    }

    fn can_go_back(&self) -> bool {
        self.index > 0
    }

    fn can_go_forward(&self) -> bool {
        self.index + 1 < self.entries.len()
    }

    fn back(&mut self) -> Option<String> {
        if !self.can_go_back() {
            return None;
        }
        self.index -= 1;
        self.entries.get(self.index).cloned()
    }

    fn forward(&mut self) -> Option<String> {
        if !self.can_go_forward() {
            return None;
        }
        self.index += 1;
        self.entries.get(self.index).cloned()
    }

    fn current(&self) -> Option<&str> {
        self.entries.get(self.index).map(String::as_str)
    }
}

#[derive(Debug)]
pub struct SoftwareBrowser {
    world: Arc<World>,
}

impl SoftwareBrowser {
    pub fn new(world: Arc<World>) -> Self {
        Self { world }
    }
}

impl BrowserFactory for SoftwareBrowser {
    fn create_environment(
        &self,
        options: EnvironmentOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn BrowserEnvironment>>> {
        let world = self.world.clone();
        async move {
            tokio::task::yield_now().await;
            FailureSwitches::check(&world.switches.environment, "environment")?;
            std::fs::create_dir_all(&options.user_data_folder)?;
            log::debug!(
                "SoftwareBrowser: environment ready in {}",
                options.user_data_folder.display()
            );

            let env: Arc<dyn BrowserEnvironment> = Arc::new(SoftwareEnvironment {
                world,
                user_data_folder: options.user_data_folder,
            });
            Ok(env)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct SoftwareEnvironment {
    world: Arc<World>,
    user_data_folder: PathBuf,
}

impl SoftwareEnvironment {
    pub fn user_data_folder(&self) -> &PathBuf {
        &self.user_data_folder
    }
}

impl BrowserEnvironment for SoftwareEnvironment {
    fn create_composition_controller(
        &self,
        window: WindowId,
    ) -> BoxFuture<'static, Result<Box<dyn CompositionController>>> {
        let world = self.world.clone();
        async move {
            tokio::task::yield_now().await;
            FailureSwitches::check(&world.switches.controller, "controller")?;
            if !world.window_alive(window) {
                return Err(anyhow!("controller window {:?} does not exist", window));
            }

            let record = Arc::new(Mutex::new(ControllerRecord::default()));
            world.register_controller(window, record.clone());

            let history = Arc::new(Mutex::new(History::default()));
            let handlers = Arc::new(Handlers::default());
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

            let worker = BrowserWorker {
                window,
                world,
                record: record.clone(),
                history: history.clone(),
                handlers: handlers.clone(),
                cmd_rx,
            };
            tokio::spawn(worker.run());

            let controller: Box<dyn CompositionController> = Box::new(SoftwareController {
                record,
                history,
                handlers,
                cmd_tx: Some(cmd_tx),
            });
            Ok(controller)
        }
        .boxed()
    }
}

#[derive(Default)]
struct Handlers {
    navigation_completed: Mutex<Option<NavigationCompletedHandler>>,
    web_message: Mutex<Option<WebMessageHandler>>,
}

#[derive(Debug)]
enum BrowserCommand {
    Navigate(String),
    NavigateToString,
    ExecuteScript(String),
    GoBack,
    GoForward,
    Repaint,
}

pub struct SoftwareController {
    record: Arc<Mutex<ControllerRecord>>,
    history: Arc<Mutex<History>>,
    handlers: Arc<Handlers>,
    cmd_tx: Option<mpsc::UnboundedSender<BrowserCommand>>,
}

impl SoftwareController {
    fn send(&self, cmd: BrowserCommand) -> Result<()> {
        let tx = self.cmd_tx.as_ref().ok_or_else(|| anyhow!("controller is closed"))?;
        tx.send(cmd).map_err(|_| anyhow!("browser process has gone away"))
    }

    fn record(&self) -> std::sync::MutexGuard<'_, ControllerRecord> {
        lock(&self.record)
    }
}

impl CompositionController for SoftwareController {
    fn apply_settings(&mut self, settings: &BrowserSettings) -> Result<()> {
        self.record().settings = Some(*settings);
        Ok(())
    }

    fn set_bounds(&mut self, bounds: Viewport) -> Result<()> {
        self.record().bounds = bounds;
        self.send(BrowserCommand::Repaint)
    }

    fn set_visible(&mut self, visible: bool) -> Result<()> {
        self.record().visible = visible;
        Ok(())
    }

    fn set_root_visual_target(&mut self, visual: Option<VisualId>) -> Result<()> {
        self.record().root_visual = visual;
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).map_err(|e| anyhow!("invalid url '{url}': {e}"))?;
        self.send(BrowserCommand::Navigate(parsed.to_string()))
    }

    fn navigate_to_string(&mut self, _html: &str) -> Result<()> {
        self.send(BrowserCommand::NavigateToString)
    }

    fn execute_script(&mut self, script: &str) -> Result<()> {
        self.record().scripts.push(script.to_string());
        self.send(BrowserCommand::ExecuteScript(script.to_string()))
    }

    fn go_back(&mut self) -> Result<()> {
        self.send(BrowserCommand::GoBack)
    }

    fn go_forward(&mut self) -> Result<()> {
        self.send(BrowserCommand::GoForward)
    }

    fn can_go_back(&self) -> bool {
        lock(&self.history).can_go_back()
    }

    fn can_go_forward(&self) -> bool {
        lock(&self.history).can_go_forward()
    }

    fn send_mouse_input(&mut self, input: MouseInput) -> Result<()> {
        let mut record = self.record();
        if record.closed {
            return Err(anyhow!("controller is closed"));
        }
        record.mouse_inputs.push(input);
        Ok(())
    }

    fn on_navigation_completed(&mut self, handler: NavigationCompletedHandler) {
        *lock(&self.handlers.navigation_completed) = Some(handler);
    }

    fn on_web_message_received(&mut self, handler: WebMessageHandler) {
        *lock(&self.handlers.web_message) = Some(handler);
    }

    fn close(&mut self) {
        self.record().closed = true;
        self.cmd_tx = None;
    }
}

/// Runs one controller's page loads until its controller goes away.
struct BrowserWorker {
    window: WindowId,
    world: Arc<World>,
    record: Arc<Mutex<ControllerRecord>>,
    history: Arc<Mutex<History>>,
    handlers: Arc<Handlers>,
    cmd_rx: mpsc::UnboundedReceiver<BrowserCommand>,
}

impl BrowserWorker {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle_command(cmd);
        }
        log::debug!("SoftwareBrowser: worker for window {:?} stopped", self.window);
    }

    fn handle_command(&mut self, cmd: BrowserCommand) {
        match cmd {
            BrowserCommand::Navigate(url) => {
                if is_unreachable(&url) {
                    self.complete(url, false);
                    return;
                }
                lock(&self.history).commit(&url, true);
                self.paint(&url);
                self.complete(url, true);
            }
            BrowserCommand::NavigateToString => {
                lock(&self.history).commit(BLANK, false);
                self.paint(BLANK);
                self.complete(BLANK.to_string(), true);
            }
            BrowserCommand::GoBack => {
                let entry = lock(&self.history).back();
                if let Some(url) = entry {
                    self.paint(&url);
                    self.complete(url, true);
                }
            }
            BrowserCommand::GoForward => {
                let entry = lock(&self.history).forward();
                if let Some(url) = entry {
                    self.paint(&url);
                    self.complete(url, true);
                }
            }
            BrowserCommand::ExecuteScript(script) => {
                if let Some(message) = parse_post_message(&script) {
                    if let Some(handler) = lock(&self.handlers.web_message).as_ref() {
                        handler(message);
                    }
                }
            }
            BrowserCommand::Repaint => {
                let current = lock(&self.history).current().map(str::to_string);
                if let Some(url) = current {
                    self.paint(&url);
                }
            }
        }
    }

    /// Presents the page color at the controller bounds, if anything is showing it.
    fn paint(&self, url: &str) {
        let size = {
            let record = lock(&self.record);
            if record.closed || !record.visible || record.root_visual.is_none() {
                return;
            }
            record.bounds.as_size()
        };
        if size.width == 0 || size.height == 0 {
            return;
        }

        let pixels = page_color(url)
            .iter()
            .copied()
            .cycle()
            .take(size.width as usize * size.height as usize * 4)
            .collect();
        if let Err(e) = self.world.present(self.window, size, pixels) {
            log::debug!("SoftwareBrowser: cannot present {url}: {e}");
        }
    }

    fn complete(&self, url: String, success: bool) {
        lock(&self.record).completed.push(url.clone());
        if let Some(handler) = lock(&self.handlers.navigation_completed).as_ref() {
            handler(NavigationCompleted { url, success });
        }
    }
}

fn is_unreachable(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == "invalid" || h.ends_with(".invalid")))
        .unwrap_or(false)
}

/// Deterministic opaque BGRA color for a page.
fn page_color(url: &str) -> [u8; 4] {
    let hash = url.bytes().fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
    let [b, g, r, _] = hash.to_le_bytes();
    [b, g, r, 0xff]
}

/// Extracts the message from a `window.chrome.webview.postMessage(<json string>)` call.
fn parse_post_message(script: &str) -> Option<String> {
    let arg = script
        .trim()
        .trim_end_matches(';')
        .strip_prefix(POST_MESSAGE)?
        .strip_suffix(')')?;
    serde_json::from_str::<String>(arg.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::SurfaceSize;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn controller(
        world: &Arc<World>,
        dir: &std::path::Path) -> (WindowId, Box<dyn CompositionController>,
    ) {
        let window = world.add_window(SurfaceSize::new(4, 4));
        let browser = SoftwareBrowser::new(world.clone());
        let env = browser
            .create_environment(EnvironmentOptions {
                user_data_folder: dir.join("profile"),
            })
            .await
            .unwrap();
        let controller = env.create_composition_controller(window).await.unwrap();
        (window, controller)
    }

    fn completions(
        controller: &mut Box<dyn CompositionController>,
    ) -> UnboundedReceiver<NavigationCompleted> {
        let (tx, rx) = mpsc::unbounded_channel();
        controller.on_navigation_completed(Box::new(move |nav| {
            let _ = tx.send(nav);
        }));
        rx
    }

    async fn next(rx: &mut UnboundedReceiver<NavigationCompleted>) -> NavigationCompleted {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn placeholder_blank_is_replaced() {
        let mut history = History::default();
        history.commit(BLANK, true);
        assert!(!history.can_go_back());
        history.commit("about:test", true);
        assert!(!history.can_go_back());
        history.commit("about:next", true);
        assert!(history.can_go_back());
    }

    #[test]
    fn commit_truncates_forward_entries() {
        let mut history = History::default();
        history.commit("a:1", true);
        history.commit("a:2", true);
        history.commit("a:3", true);
        assert_eq!(history.back().as_deref(), Some("a:2"));
        assert!(history.can_go_forward());
        history.commit("a:4", true);
        assert!(!history.can_go_forward());
        assert_eq!(history.entries, vec!["a:1", "a:2", "a:4"]);
    }

    #[test]
    fn post_message_parsing() {
        assert_eq!(
            parse_post_message(r#"window.chrome.webview.postMessage("hi \"there\"");"#).as_deref(),
            Some(r#"hi "there""#)
        );
        assert_eq!(parse_post_message("console.log(1)"), None);
        assert_eq!(parse_post_message("window.chrome.webview.postMessage(42)"), None);
    }

    #[test]
    fn invalid_hosts_are_unreachable() {
        assert!(is_unreachable("https://nowhere.invalid/"));
        assert!(!is_unreachable("https://example.com/"));
        assert!(!is_unreachable("about:test"));
    }

    #[tokio::test]
    async fn navigation_completes_and_builds_history() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let (_window, mut controller) = controller(&world, dir.path()).await;
        assert!(dir.path().join("profile").is_dir());

        let mut rx = completions(&mut controller);
        controller.navigate("about:blank").unwrap();
        assert_eq!(next(&mut rx).await.url, "about:blank");

        controller.navigate("about:test").unwrap();
        let nav = next(&mut rx).await;
        assert_eq!(nav, NavigationCompleted { url: "about:test".into(), success: true });
        assert!(!controller.can_go_back());

        controller.navigate("https://example.com/").unwrap();
        next(&mut rx).await;
        assert!(controller.can_go_back());

        controller.go_back().unwrap();
        assert_eq!(next(&mut rx).await.url, "about:test");
        assert!(controller.can_go_forward());
    }

    #[tokio::test]
    async fn bad_urls() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let (_window, mut controller) = controller(&world, dir.path()).await;
        let mut rx = completions(&mut controller);

        assert!(controller.navigate("not a url").is_err());
        controller.navigate("https://host.invalid/").unwrap();
        assert!(!next(&mut rx).await.success);
        assert!(!controller.can_go_back());
    }

    #[tokio::test]
    async fn paints_into_window_when_targeted() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let (window, mut controller) = controller(&world, dir.path()).await;
        let mut rx = completions(&mut controller);

        controller.set_bounds(Viewport::sized(4, 4)).unwrap();
        controller.navigate("about:test").unwrap();
        next(&mut rx).await;
        assert!(world.latest_frame(window, 0).is_none());

        controller.set_visible(true).unwrap();
        controller.set_root_visual_target(Some(VisualId(99))).unwrap();
        controller.navigate("about:other").unwrap();
        next(&mut rx).await;
        let frame = world.latest_frame(window, 0).unwrap();
        assert_eq!(frame.size, SurfaceSize::new(4, 4));
        assert_eq!(&frame.pixels[..4], &page_color("about:other"));
    }

    #[tokio::test]
    async fn scripts_post_messages() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let (window, mut controller) = controller(&world, dir.path()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.on_web_message_received(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));
        controller.execute_script(r#"window.chrome.webview.postMessage("ping")"#).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(msg.as_deref(), Some("ping"));
        assert_eq!(world.controller(window).unwrap().scripts.len(), 1);
    }

    #[tokio::test]
    async fn closed_controller_rejects_commands() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let (window, mut controller) = controller(&world, dir.path()).await;
        controller.close();
        assert!(world.controller(window).unwrap().closed);
        assert!(controller.navigate("about:test").is_err());
    }

    #[tokio::test]
    async fn creation_failures() {
        let dir = tempfile::tempdir().unwrap();
        let world = Arc::new(World::default());
        let browser = SoftwareBrowser::new(world.clone());
        let options = EnvironmentOptions {
            user_data_folder: dir.path().to_path_buf(),
        };

        world.switches.environment.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(browser.create_environment(options.clone()).await.is_err());
        world.switches.environment.store(false, std::sync::atomic::Ordering::SeqCst);

        let env = browser.create_environment(options).await.unwrap();
        assert!(env.create_composition_controller(WindowId(12345)).await.is_err());
    }
}
