//! 异步文件加载器
//!
//! ## 线程结构
//! - 调用方通过 `load` 把请求放入 channel，只阻塞到入队为止。
//! - 内部的 dispatch 线程接收请求，把 `FileLoader::load` 分发到专用的 rayon 线程池。
//! - 加载完成后在 worker 线程上直接调用请求携带的回调，回调中不应持有需要独占的 GPU 录制对象，
//!   上传应当通过 `ResourceContext` 完成（它内部会串行化录制）。
//!
//! ## 暂停
//! `pause` 会让 dispatch 线程停止分发新请求，并等待已经分发出去的任务（包括回调）全部结束后返回；
//! 暂停期间的请求留在队列中，`resume` 后继续分发。
//!
//! ## 线程生命周期
//! dispatch 线程与 `AsyncFileLoader` 绑定。Drop 时：
//! 1. 关闭请求 channel，未暂停时队列中剩余的请求仍会被分发；暂停状态下剩余请求以 `Stopped` 结束。
//! 2. 等待所有已分发任务完成（WaitGroup），join dispatch 线程。
//! 3. 对所有常驻 payload 调用各自 loader 的析构函数。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use truvis_resource::resource_data::UserData;

use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::file_loader::{FileLoader, FnFileLoader, LoadedPayload};

pub type LoadResult = Result<LoadedPayload, LoaderError>;

/// 发起加载的一方，原样传回回调
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RequesterId(pub u64);

/// 传给回调的加载结果
pub struct LoadCompletion {
    pub requester: RequesterId,
    pub tag: String,
    pub path: PathBuf,
    pub result: LoadResult,
    pub user_data: Option<UserData>,
}

impl LoadCompletion {
    #[inline]
    pub fn payload(&self) -> Option<&LoadedPayload> {
        self.result.as_ref().ok()
    }
}

pub type LoadCallback = Box<dyn FnOnce(LoadCompletion) + Send>;

struct LoadRequest {
    tag: String,
    path: PathBuf,
    requester: RequesterId,
    /// 入队时解析，之后重新注册同一个 tag 不影响已入队的请求
    loader: Arc<dyn FileLoader>,
    callback: LoadCallback,
    user_data: Option<UserData>,
}

impl LoadRequest {
    fn complete(self, result: LoadResult) {
        (self.callback)(LoadCompletion {
            requester: self.requester,
            tag: self.tag,
            path: self.path,
            result,
            user_data: self.user_data,
        });
    }
}

enum ControlMessage {
    /// 暂停分发，在途任务结束后通过 sender 应答
    Pause(Sender<()>),
    Resume,
}

struct ResidentFile {
    payload: LoadedPayload,
    /// 析构时使用加载它的那个 loader
    loader: Arc<dyn FileLoader>,
    refcount: usize,
}

/// path 为 [`normalize_path`] 之后的绝对路径
type ResidentKey = (String, PathBuf);
type ResidentMap = HashMap<ResidentKey, ResidentFile>;

/// 转换为绝对路径并在字面上消去 `.` 和 `..`，不访问文件系统
///
/// 同一个文件的不同写法（`x.bin`、`./x.bin`、`dir/../x.bin`）得到同一个 key。
/// 无法取得当前目录时原样返回。
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = match std::path::absolute(path) {
        Ok(absolute) => absolute,
        Err(e) => {
            log::warn!("failed to make {:?} absolute, using it as is: {}", path, e);
            return path.to_path_buf();
        }
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn lock_resident(resident: &Mutex<ResidentMap>) -> MutexGuard<'_, ResidentMap> {
    resident.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AsyncFileLoader {
    factories: RwLock<HashMap<String, Arc<dyn FileLoader>>>,
    /// 当前常驻内存的文件，key 为 (tag, path)
    resident: Arc<Mutex<ResidentMap>>,
    paused: AtomicBool,

    request_sender: Option<Sender<LoadRequest>>,
    control_sender: Option<Sender<ControlMessage>>,
    dispatch_thread: Option<thread::JoinHandle<()>>,
}

impl Default for AsyncFileLoader {
    fn default() -> Self {
        Self::new(&LoaderConfig::default())
    }
}

// new & init
impl AsyncFileLoader {
    pub fn new(config: &LoaderConfig) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<LoadRequest>();
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlMessage>();
        let resident: Arc<Mutex<ResidentMap>> = Arc::new(Mutex::new(HashMap::new()));

        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name(move |index| format!("{}-{}", prefix, index))
            .build()
            .expect("Failed to create file loader thread pool");

        let dispatch_resident = resident.clone();
        let dispatch_thread = thread::Builder::new()
            .name("FileDispatchThread".to_string())
            .spawn(move || dispatch_loop(pool, request_rx, control_rx, dispatch_resident))
            .expect("Failed to spawn file dispatcher thread");

        Self {
            factories: RwLock::new(HashMap::new()),
            resident,
            paused: AtomicBool::new(false),
            request_sender: Some(request_tx),
            control_sender: Some(control_tx),
            dispatch_thread: Some(dispatch_thread),
        }
    }

    /// 注册 tag 对应的 loader
    ///
    /// 同一个 tag 重复注册时后注册的生效；已经常驻的文件仍然使用加载它时的 loader 析构。
    pub fn register_file_type(&self, tag: &str, loader: Arc<dyn FileLoader>) {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.insert(tag.to_string(), loader).is_some() {
            log::warn!("file loader for tag \"{}\" re-registered, the previous one is replaced", tag);
        } else {
            log::debug!("file loader registered: \"{}\"", tag);
        }
    }

    /// 用一对闭包注册 loader
    pub fn register_file_type_fn<L, D>(&self, tag: &str, load_fn: L, destroy_fn: D)
    where
        L: Fn(&Path) -> anyhow::Result<LoadedPayload> + Send + Sync + 'static,
        D: Fn(LoadedPayload) + Send + Sync + 'static,
    {
        self.register_file_type(tag, Arc::new(FnFileLoader::new(load_fn, destroy_fn)));
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.factories.read().unwrap_or_else(PoisonError::into_inner).contains_key(tag)
    }

    fn factory(&self, tag: &str) -> Result<Arc<dyn FileLoader>, LoaderError> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
            .ok_or_else(|| LoaderError::UnregisteredTag(tag.to_string()))
    }
}

// load & unload
impl AsyncFileLoader {
    /// 请求加载文件
    ///
    /// 非阻塞。文件已经常驻时不会再次加载，引用计数加一，并在当前线程上立刻调用回调；
    /// 否则请求入队，回调在 worker 线程上调用。仍在加载中的同一文件不会合并。
    ///
    /// tag 没有注册时直接返回错误，回调不会被调用。
    /// 路径先经过 [`normalize_path`]，回调收到的也是规范化之后的路径。
    pub fn load<F>(
        &self,
        tag: &str,
        path: impl Into<PathBuf>,
        requester: RequesterId,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<(), LoaderError>
    where
        F: FnOnce(LoadCompletion) + Send + 'static,
    {
        let loader = self.factory(tag)?;
        let path: PathBuf = path.into();
        let path = normalize_path(&path);

        let resident_payload = {
            let mut resident = lock_resident(&self.resident);
            resident.get_mut(&(tag.to_string(), path.clone())).map(|file| {
                file.refcount += 1;
                file.payload.clone()
            })
        };

        let request = LoadRequest {
            tag: tag.to_string(),
            path,
            requester,
            loader,
            callback: Box::new(callback),
            user_data,
        };

        if let Some(payload) = resident_payload {
            log::debug!("file already resident: \"{}\" {:?}", request.tag, request.path);
            request.complete(Ok(payload));
            return Ok(());
        }

        let sender = self.request_sender.as_ref().ok_or(LoaderError::Stopped)?;
        sender.send(request).map_err(|_| LoaderError::Stopped)
    }

    /// 释放一次对常驻文件的使用
    ///
    /// 引用计数归零时调用 loader 的析构函数并移除，返回 `true`；文件不在常驻表中时什么都不做。
    pub fn unload(&self, tag: &str, path: impl AsRef<Path>) -> Result<bool, LoaderError> {
        if !self.is_registered(tag) {
            return Err(LoaderError::UnregisteredTag(tag.to_string()));
        }

        let key = (tag.to_string(), normalize_path(path.as_ref()));
        let released = {
            let mut resident = lock_resident(&self.resident);
            let Some(file) = resident.get_mut(&key) else {
                return Ok(false);
            };
            file.refcount -= 1;
            if file.refcount == 0 { resident.remove(&key) } else { None }
        };

        match released {
            Some(file) => {
                log::debug!("file unloaded: \"{}\" {:?}", key.0, key.1);
                file.loader.destroy(file.payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_resident(&self, tag: &str, path: impl AsRef<Path>) -> bool {
        self.resident_refcount(tag, path).is_some()
    }

    pub fn resident_refcount(&self, tag: &str, path: impl AsRef<Path>) -> Option<usize> {
        let key = (tag.to_string(), normalize_path(path.as_ref()));
        lock_resident(&self.resident).get(&key).map(|file| file.refcount)
    }

    pub fn resident_count(&self) -> usize {
        lock_resident(&self.resident).len()
    }
}

// pause & resume
impl AsyncFileLoader {
    /// 停止分发新请求，阻塞到在途任务全部完成
    ///
    /// 不能在加载回调中调用，否则会等待自己。
    pub fn pause(&self) -> Result<(), LoaderError> {
        let _span = tracy_client::span!("AsyncFileLoader::pause");
        let sender = self.control_sender.as_ref().ok_or(LoaderError::Stopped)?;
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        sender.send(ControlMessage::Pause(ack_tx)).map_err(|_| LoaderError::Stopped)?;
        ack_rx.recv().map_err(|_| LoaderError::Stopped)?;

        self.paused.store(true, Ordering::Release);
        log::info!("async file loader paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), LoaderError> {
        let sender = self.control_sender.as_ref().ok_or(LoaderError::Stopped)?;
        sender.send(ControlMessage::Resume).map_err(|_| LoaderError::Stopped)?;

        self.paused.store(false, Ordering::Release);
        log::info!("async file loader resumed");
        Ok(())
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Drop for AsyncFileLoader {
    fn drop(&mut self) {
        // 必须先关闭请求 channel，再关闭控制 channel：
        // 未暂停的 dispatch 线程在控制 channel 断开后会把剩余请求分发完
        self.request_sender = None;
        self.control_sender = None;

        log::info!("AsyncFileLoader is being dropped, waiting for tasks to complete...");
        if let Some(thread) = self.dispatch_thread.take()
            && thread.join().is_err()
        {
            log::error!("Failed to join file dispatcher thread");
        }

        let resident = std::mem::take(&mut *lock_resident(&self.resident));
        let resident_count = resident.len();
        for (_, file) in resident {
            file.loader.destroy(file.payload);
        }
        log::info!("All file tasks completed, {} resident files destroyed.", resident_count);
    }
}

/// dispatch 线程主循环
fn dispatch_loop(
    pool: rayon::ThreadPool,
    request_rx: Receiver<LoadRequest>,
    control_rx: Receiver<ControlMessage>,
    resident: Arc<Mutex<ResidentMap>>,
) {
    let mut wait_group = WaitGroup::new();
    let mut paused = false;

    loop {
        if paused {
            match control_rx.recv() {
                Ok(ControlMessage::Resume) => paused = false,
                Ok(ControlMessage::Pause(ack)) => {
                    let _ = ack.send(());
                }
                Err(_) => break,
            }
            continue;
        }

        crossbeam_channel::select! {
            recv(control_rx) -> msg => match msg {
                Ok(ControlMessage::Pause(ack)) => {
                    paused = true;
                    std::mem::replace(&mut wait_group, WaitGroup::new()).wait();
                    let _ = ack.send(());
                }
                Ok(ControlMessage::Resume) => {}
                Err(_) => {
                    // loader 正在析构，请求 channel 已经关闭，分发剩余请求后退出
                    for request in request_rx.iter() {
                        spawn_load_task(&pool, &wait_group, &resident, request);
                    }
                    break;
                }
            },
            recv(request_rx) -> msg => match msg {
                Ok(request) => spawn_load_task(&pool, &wait_group, &resident, request),
                Err(_) => break,
            },
        }
    }

    wait_group.wait();

    for request in request_rx.try_iter() {
        log::warn!("load request dropped on shutdown: \"{}\" {:?}", request.tag, request.path);
        request.complete(Err(LoaderError::Stopped));
    }
}

fn spawn_load_task(
    pool: &rayon::ThreadPool,
    wait_group: &WaitGroup,
    resident: &Arc<Mutex<ResidentMap>>,
    request: LoadRequest,
) {
    let _span = tracy_client::span!("AsyncFileLoader::dispatch");

    // 任务结束时闭包销毁，wg_task 随之 drop
    let wg_task = wait_group.clone();
    let resident = resident.clone();
    pool.spawn(move || {
        run_load_task(request, &resident);
        drop(wg_task);
    });
}

/// 实际的加载任务 (运行在 rayon 线程池中)
fn run_load_task(request: LoadRequest, resident: &Mutex<ResidentMap>) {
    let _span = tracy_client::span!("AsyncFileLoader::load_task");

    let loaded = panic::catch_unwind(AssertUnwindSafe(|| request.loader.load(&request.path)));
    let result = match loaded {
        Ok(Ok(payload)) => Ok(make_resident(resident, &request, payload)),
        Ok(Err(source)) => Err(LoaderError::Factory {
            tag: request.tag.clone(),
            path: request.path.clone(),
            source,
        }),
        Err(_) => Err(LoaderError::Factory {
            tag: request.tag.clone(),
            path: request.path.clone(),
            source: anyhow::anyhow!("file loader panicked"),
        }),
    };

    if let Err(e) = &result {
        log::error!("{}", e);
    }
    request.complete(result);
}

/// 把新加载的 payload 放入常驻表
///
/// 同一文件的两次加载可能同时在途，后完成的一次复用已常驻的 payload，并析构自己加载的那份。
fn make_resident(resident: &Mutex<ResidentMap>, request: &LoadRequest, payload: LoadedPayload) -> LoadedPayload {
    let duplicate = {
        let mut resident = lock_resident(resident);
        match resident.entry((request.tag.clone(), request.path.clone())) {
            Entry::Occupied(mut entry) => {
                let file = entry.get_mut();
                file.refcount += 1;
                Some(file.payload.clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(ResidentFile {
                    payload: payload.clone(),
                    loader: request.loader.clone(),
                    refcount: 1,
                });
                None
            }
        }
    };

    match duplicate {
        Some(existing) => {
            request.loader.destroy(payload);
            existing
        }
        None => {
            log::debug!("file loaded: \"{}\" {:?}", request.tag, request.path);
            payload
        }
    }
}
