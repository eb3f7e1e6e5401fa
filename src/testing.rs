//! In-memory adapters and request helpers for tests.
//! MUST NEVER be used in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Builder;
use axum::http::{Method, header};
use axum::response::Response;
use chrono::{NaiveDate, Utc};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use crate::AppState;
use crate::auth::AuthService;
use crate::cache::{IdentityCache, MemoryCache};
use crate::clock::Clock;
use crate::config::{Argon2, Configuration};
use crate::contact::{
    CONTACT_TAKEN, Contact, ContactFilter, ContactPatch, ContactRepository,
    NewContact, is_upcoming_birthday,
};
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::mail::{Mailer, Template, Variables};
use crate::avatar::AvatarHost;
use crate::session::SessionResolver;
use crate::token::TokenManager;
use crate::user::{EMAIL_TAKEN, NewUser, Role, User, UserRepository};

pub const HOST: &str = "http://localhost:8000";
pub const AVATAR_HOST: &str = "https://avatars.test";

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(1_700_000_000)))
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, timestamp: u64) {
        self.0.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cheap Argon2 parameters.
pub fn password_manager() -> PasswordManager {
    PasswordManager::new(Some(Argon2 {
        memory_cost: 8,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }))
    .unwrap()
}

pub fn token_manager(clock: Arc<dyn Clock>) -> TokenManager {
    TokenManager::new("test_secret", "HS256", clock).unwrap()
}

pub fn user(id: i32, email: &str) -> User {
    User {
        id,
        username: format!("user_{id}"),
        email: email.to_owned(),
        password: "not a hash".into(),
        avatar: None,
        refresh_token: None,
        role: Role::User,
        confirmed: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn contact(id: i32, owner: i32, first: &str, last: &str, email: &str) -> Contact {
    Contact {
        id,
        first_name: first.to_owned(),
        last_name: last.to_owned(),
        email: email.to_owned(),
        phone: "+33 1 23 45 67 89".into(),
        birthday: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        additional_info: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        user_id: owner,
    }
}

/// Users kept in a map keyed by email.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: Mutex<HashMap<String, User>>,
    lookups: AtomicUsize,
    fail_rotation: AtomicBool,
}

impl MemoryUserRepository {
    pub fn add(&self, user: User) {
        self.users.lock().unwrap().insert(user.email.clone(), user);
    }

    /// Number of [`UserRepository::find_by_email`] calls.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of stored accounts.
    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn stored(&self, email: &str) -> User {
        self.users.lock().unwrap()[email].clone()
    }

    /// Make the next conditional rotation lose its race.
    pub fn fail_next_rotation(&self) {
        self.fail_rotation.store(true, Ordering::SeqCst);
    }

    pub fn set_role(&self, email: &str, role: Role) {
        if let Some(user) = self.users.lock().unwrap().get_mut(email) {
            user.role = role;
        }
    }

    fn edit<T>(&self, email: &str, f: impl FnOnce(&mut User) -> T) -> Result<T> {
        self.users
            .lock()
            .unwrap()
            .get_mut(email)
            .map(f)
            .ok_or_else(|| ServerError::NotFound("User not found".into()))
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.lock().unwrap().get(email).cloned())
    }

    async fn insert(&self, new: NewUser) -> Result<User> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&new.email) {
            return Err(ServerError::Conflict(EMAIL_TAKEN.into()));
        }

        let id = users.values().map(|user| user.id).max().unwrap_or(0) + 1;
        let mut created = user(id, &new.email);
        created.username = new.username;
        created.password = new.password;
        created.avatar = new.avatar;
        created.confirmed = false;
        users.insert(created.email.clone(), created.clone());

        Ok(created)
    }

    async fn update_refresh_token(&self, user_id: i32, token: Option<&str>) -> Result<()> {
        if let Some(user) = self
            .users
            .lock()
            .unwrap()
            .values_mut()
            .find(|user| user.id == user_id)
        {
            user.refresh_token = token.map(str::to_owned);
        }
        Ok(())
    }

    async fn rotate_refresh_token(&self, user_id: i32, current: &str, next: &str) -> Result<bool> {
        if self.fail_rotation.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let mut users = self.users.lock().unwrap();
        match users.values_mut().find(|user| user.id == user_id) {
            Some(user) if user.refresh_token.as_deref() == Some(current) => {
                user.refresh_token = Some(next.to_owned());
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn set_confirmed(&self, email: &str) -> Result<()> {
        self.edit(email, |user| user.confirmed = true)
    }

    async fn update_avatar(&self, email: &str, url: &str) -> Result<User> {
        self.edit(email, |user| {
            user.avatar = Some(url.to_owned());
            user.clone()
        })
    }

    async fn update_password(&self, email: &str, password: &str) -> Result<()> {
        self.edit(email, |user| user.password = password.to_owned())
    }
}

/// Contacts kept in insertion order.
pub struct MemoryContactRepository {
    contacts: Mutex<Vec<Contact>>,
    next_id: AtomicI32,
    healthy: AtomicBool,
}

impl Default for MemoryContactRepository {
    fn default() -> Self {
        Self {
            contacts: Mutex::default(),
            next_id: AtomicI32::new(1),
            healthy: AtomicBool::new(true),
        }
    }
}

impl MemoryContactRepository {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContactRepository for MemoryContactRepository {
    async fn list(&self, owner: Option<i32>, filter: &ContactFilter) -> Result<Vec<Contact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|contact| owner.is_none_or(|owner| contact.user_id == owner))
            .filter(|contact| filter.matches(contact))
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, owner: i32, id: i32) -> Result<Option<Contact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|contact| contact.id == id && contact.user_id == owner)
            .cloned())
    }

    async fn upcoming_birthdays(
        &self,
        owner: i32,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<Contact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|contact| contact.user_id == owner)
            .filter(|contact| is_upcoming_birthday(contact.birthday, today, days))
            .cloned()
            .collect())
    }

    async fn create(&self, owner: i32, new: NewContact) -> Result<Contact> {
        let mut contacts = self.contacts.lock().unwrap();
        if contacts
            .iter()
            .any(|contact| contact.user_id == owner && contact.email == new.email)
        {
            return Err(ServerError::Conflict(CONTACT_TAKEN.into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut created = contact(id, owner, &new.first_name, &new.last_name, &new.email);
        created.phone = new.phone;
        created.birthday = new.birthday;
        created.additional_info = new.additional_info;
        contacts.push(created.clone());

        Ok(created)
    }

    async fn update(&self, owner: i32, id: i32, patch: ContactPatch) -> Result<Option<Contact>> {
        let mut contacts = self.contacts.lock().unwrap();

        let taken = patch.email.as_ref().is_some_and(|email| {
            contacts
                .iter()
                .any(|c| c.user_id == owner && c.id != id && &c.email == email)
        });
        if taken {
            return Err(ServerError::Conflict(CONTACT_TAKEN.into()));
        }

        let Some(contact) = contacts
            .iter_mut()
            .find(|contact| contact.id == id && contact.user_id == owner)
        else {
            return Ok(None);
        };

        if let Some(value) = patch.first_name {
            contact.first_name = value;
        }
        if let Some(value) = patch.last_name {
            contact.last_name = value;
        }
        if let Some(value) = patch.email {
            contact.email = value;
        }
        if let Some(value) = patch.phone {
            contact.phone = value;
        }
        if let Some(value) = patch.birthday {
            contact.birthday = value;
        }
        if patch.additional_info.is_some() {
            contact.additional_info = patch.additional_info;
        }
        contact.updated_at = Utc::now();

        Ok(Some(contact.clone()))
    }

    async fn delete(&self, owner: i32, id: i32) -> Result<bool> {
        let mut contacts = self.contacts.lock().unwrap();
        let before = contacts.len();
        contacts.retain(|contact| !(contact.id == id && contact.user_id == owner));
        Ok(contacts.len() != before)
    }

    async fn healthcheck(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServerError::Internal {
                details: "database unreachable".into(),
                source: None,
            })
        }
    }
}

/// Mailer keeping every sent message.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, Template, Variables)>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<(String, Template, Variables)> {
        self.sent.lock().unwrap().clone()
    }

    /// Make every following send fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, template: Template, variables: Variables) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServerError::Internal {
                details: "broker unreachable".into(),
                source: None,
            });
        }

        self.sent
            .lock()
            .unwrap()
            .push((to.to_owned(), template, variables));
        Ok(())
    }
}

/// Avatar host answering with a fixed URL prefix.
pub struct StaticAvatarHost;

#[async_trait]
impl AvatarHost for StaticAvatarHost {
    async fn upload(&self, public_id: &str, _image: Vec<u8>) -> Result<String> {
        Ok(format!("{AVATAR_HOST}/{public_id}"))
    }
}

/// Cache whose every call fails.
pub struct FailingCache;

fn cache_down() -> ServerError {
    ServerError::Internal {
        details: "cache unreachable".into(),
        source: None,
    }
}

#[async_trait]
impl IdentityCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(cache_down())
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(cache_down())
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> Result<()> {
        Err(cache_down())
    }
}

/// Fully wired application over in-memory adapters.
pub struct TestContext {
    pub state: AppState,
    pub auth: Arc<AuthService>,
    pub session: Arc<SessionResolver>,
    pub tokens: Arc<TokenManager>,
    pub users: Arc<MemoryUserRepository>,
    pub contacts: Arc<MemoryContactRepository>,
    pub mailer: Arc<RecordingMailer>,
    pub clock: Arc<ManualClock>,
}

pub fn context() -> TestContext {
    let clock = ManualClock::arc();
    let tokens = Arc::new(token_manager(clock.clone()));
    let users = Arc::new(MemoryUserRepository::default());
    let contacts = Arc::new(MemoryContactRepository::default());
    let mailer = Arc::new(RecordingMailer::default());

    let session = Arc::new(SessionResolver::new(
        tokens.clone(),
        users.clone(),
        Arc::new(MemoryCache::new(clock.clone())),
    ));
    let auth = Arc::new(AuthService::new(
        users.clone(),
        tokens.clone(),
        Arc::new(password_manager()),
        session.clone(),
        mailer.clone(),
        Arc::new(StaticAvatarHost),
        HOST,
    ));

    let state = AppState {
        config: Arc::new(Configuration::default()),
        auth: auth.clone(),
        session: session.clone(),
        tokens: tokens.clone(),
        contacts: contacts.clone(),
        clock: clock.clone(),
        metrics: None,
    };

    TestContext {
        state,
        auth,
        session,
        tokens,
        users,
        contacts,
        mailer,
        clock,
    }
}

/// Request sent straight to a [`Router`].
pub struct TestRequest {
    app: Router,
    builder: Builder,
    body: Body,
}

pub fn request(app: Router, method: Method, path: &str) -> TestRequest {
    TestRequest {
        app,
        builder: Request::builder().method(method).uri(path),
        body: Body::empty(),
    }
}

impl TestRequest {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header(header::AUTHORIZATION.as_str(), &format!("Bearer {token}"))
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        self.builder = self.builder.header(header::CONTENT_TYPE, content_type.into());
        self.body = Body::from(body.into());
        self
    }

    pub fn json(self, body: impl Into<String>) -> Self {
        self.body("application/json", body)
    }

    pub fn form(self, body: impl Into<String>) -> Self {
        self.body("application/x-www-form-urlencoded", body)
    }

    pub async fn send(self) -> Response {
        self.app
            .oneshot(self.builder.body(self.body).unwrap())
            .await
            .unwrap()
    }
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
