//! Single-threaded apartment for WebView2 and composition objects.
//!
//! Completion handlers of those objects only fire while their thread pumps messages, so
//! the [`UiThread`] runs a message loop and receives work as closures. Objects created
//! there stay in a thread-local table and other threads refer to them by id.

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use windows::System::DispatcherQueueController;
use windows::Win32::Foundation::{LPARAM, WPARAM};
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_APARTMENTTHREADED};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::System::WinRT::{
    CreateDispatcherQueueController, DispatcherQueueOptions, DQTAT_COM_STA, DQTYPE_THREAD_CURRENT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, GetMessageW, KillTimer, PeekMessageW, PostThreadMessageW, SetTimer,
    TranslateMessage, MSG, PM_NOREMOVE, WM_APP, WM_QUIT, WM_TIMER, WM_USER,
};

const WM_RUN_TASKS: u32 = WM_APP + 1;
const TASK_POLL_MS: u32 = 100;

type Task = Box<dyn FnOnce() + Send>;

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OBJECTS: RefCell<HashMap<u64, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Thread running a message loop in a single-threaded COM apartment.
pub struct UiThread {
    thread_id: u32,
    tasks: Mutex<mpsc::Sender<Task>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UiThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiThread").field("thread_id", &self.thread_id).finish()
    }
}

impl UiThread {
    /// Starts the thread and waits until its message queue and dispatcher queue exist.
    pub fn spawn(name: &str) -> Result<Arc<Self>> {
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();

        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(task_rx, ready_tx))
            .context("spawning the UI thread")?;

        let thread_id = ready_rx
            .recv()
            .map_err(|_| anyhow!("UI thread exited during startup"))??;

        Ok(Arc::new(Self {
            thread_id,
            tasks: Mutex::new(task_tx),
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn is_current(&self) -> bool {
        unsafe { GetCurrentThreadId() == self.thread_id }
    }

    /// Queues `task` without waiting for it.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(Box::new(task))
            .map_err(|_| anyhow!("UI thread has stopped"))?;
        unsafe { PostThreadMessageW(self.thread_id, WM_RUN_TASKS, WPARAM(0), LPARAM(0)) }
            .context("waking the UI thread")
    }

    /// Runs `f` on the UI thread and blocks until it returns.
    pub fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> Result<R> + Send + 'static,
    ) -> Result<R> {
        if self.is_current() {
            return f();
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move || {
            let _ = tx.send(f());
        })?;
        rx.recv().map_err(|_| anyhow!("UI thread dropped the call"))?
    }

    /// Starts an operation that completes later, from a handler on the UI thread.
    ///
    /// `start` runs on the UI thread and hands `completion` to its completion handler.
    /// An error from `start` itself resolves the future right away.
    pub fn call_async<R: Send + 'static>(
        &self,
        start: impl FnOnce(Completion<R>) -> Result<()> + Send + 'static,
    ) -> BoxFuture<'static, Result<R>> {
        let (tx, rx) = oneshot::channel::<Result<R>>();
        let completion = Completion(Arc::new(Mutex::new(Some(tx))));

        let posted = self.post(move || {
            if let Err(e) = start(completion.clone()) {
                completion.complete(Err(e));
            }
        });

        async move {
            posted?;
            rx.await.map_err(|_| anyhow!("operation was abandoned"))?
        }
        .boxed()
    }
}

/// Resolves the future returned by [`UiThread::call_async`]. Only the first result counts.
pub struct Completion<R>(Arc<Mutex<Option<oneshot::Sender<Result<R>>>>>);

impl<R> Clone for Completion<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<R> Completion<R> {
    pub fn complete(&self, result: Result<R>) {
        if let Some(tx) = self.0.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for UiThread {
    fn drop(&mut self) {
        unsafe {
            let _ = PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
        if let Some(join) = self.join.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if !self.is_current() {
                let _ = join.join();
            }
        }
    }
}

fn run(tasks: mpsc::Receiver<Task>, ready: mpsc::Sender<Result<u32>>) {
    if let Err(e) = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) }.ok() {
        let _ = ready.send(Err(anyhow!("CoInitializeEx failed: {e}")));
        return;
    }

    let queue = match create_dispatcher_queue() {
        Ok(queue) => queue,
        Err(e) => {
            let _ = ready.send(Err(e));
            unsafe { CoUninitialize() };
            return;
        }
    };

    let mut msg = MSG::default();
    unsafe {
        // Forces the thread message queue into existence before anyone posts to it
        let _ = PeekMessageW(&mut msg, None, WM_USER, WM_USER, PM_NOREMOVE);
    }
    // Modal loops inside COM calls can swallow thread messages; the timer keeps tasks moving
    let timer = unsafe { SetTimer(None, 0, TASK_POLL_MS, None) };
    let _ = ready.send(Ok(unsafe { GetCurrentThreadId() }));

    loop {
        let status = unsafe { GetMessageW(&mut msg, None, 0, 0) };
        if status.0 <= 0 {
            break;
        }
        if msg.hwnd.is_invalid() && (msg.message == WM_RUN_TASKS || msg.message == WM_TIMER) {
            while let Ok(task) = tasks.try_recv() {
                task();
            }
            continue;
        }
        unsafe {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    unsafe {
        let _ = KillTimer(None, timer);
    }

    OBJECTS.with(|objects| objects.borrow_mut().clear());
    drop(queue);
    unsafe { CoUninitialize() };
    log::debug!("UiThread: message loop finished");
}

fn create_dispatcher_queue() -> Result<DispatcherQueueController> {
    let options = DispatcherQueueOptions {
        dwSize: std::mem::size_of::<DispatcherQueueOptions>() as u32,
        threadType: DQTYPE_THREAD_CURRENT,
        apartmentType: DQTAT_COM_STA,
    };
    unsafe { CreateDispatcherQueueController(options) }.context("creating the dispatcher queue")
}

/// Keeps `object` on the current (UI) thread and returns its id.
pub fn store<T: 'static>(object: T) -> u64 {
    let id = NEXT_OBJECT.fetch_add(1, Ordering::Relaxed);
    OBJECTS.with(|objects| objects.borrow_mut().insert(id, Box::new(object)));
    id
}

/// Clone of a stored object. COM and WinRT clones share the underlying object.
pub fn get<T: Clone + 'static>(id: u64) -> Result<T> {
    OBJECTS.with(|objects| {
        objects
            .borrow()
            .get(&id)
            .and_then(|o| o.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| anyhow!("no {} with id {id}", std::any::type_name::<T>()))
    })
}

/// Takes a stored object out of the table.
pub fn remove<T: 'static>(id: u64) -> Option<T> {
    OBJECTS.with(|objects| {
        let boxed = objects.borrow_mut().remove(&id)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_run_on_the_ui_thread() {
        let ui = UiThread::spawn("wvt-ui-test").unwrap();
        let expected = ui.thread_id();
        let seen = ui.call(|| Ok(unsafe { GetCurrentThreadId() })).unwrap();
        assert_eq!(seen, expected);
        assert!(!ui.is_current());
    }

    #[test]
    fn stored_objects_stay_on_their_thread() {
        let ui = UiThread::spawn("wvt-ui-test").unwrap();
        let id = ui.call(|| Ok(store(String::from("visual")))).unwrap();

        assert_eq!(ui.call(move || get::<String>(id)).unwrap(), "visual");
        // Another thread has its own, empty table
        assert!(get::<String>(id).is_err());
        assert!(ui.call(move || get::<u32>(id)).is_err());

        assert_eq!(ui.call(move || Ok(remove::<String>(id))).unwrap().as_deref(), Some("visual"));
        assert!(ui.call(move || get::<String>(id)).is_err());
    }

    #[tokio::test]
    async fn async_calls_resolve_from_a_later_task() {
        let ui = UiThread::spawn("wvt-ui-test").unwrap();
        let poster = ui.clone();
        let value = ui
            .call_async(move |completion: Completion<u32>| {
                poster.post(move || completion.complete(Ok(7)))
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let failed = ui
            .call_async(|_: Completion<u32>| Err(anyhow!("refused")))
            .await;
        assert!(failed.is_err());
    }
}
