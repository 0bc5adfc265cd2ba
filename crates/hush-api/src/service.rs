use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hush_crypto::keys::parse_public_key;
use hush_crypto::{KeyError, KeyExchange, SessionTokens};
use hush_db::{ConversationStore, IdentityStore, PageCursor};
use hush_gateway::LiveChannel;
use hush_types::api::{
    ConversationView, CreateConversationRequest, CreateConversationResponse, ListConversationsQuery,
    ListConversationsResponse, ListMessagesResponse, LoginRequest, LoginResponse, MessageView,
    PostMessageRequest, PostMessageResponse, PublicKeyResponse, RegisterRequest, RegisterResponse,
    SessionKeyResponse, StatusResponse,
};
use hush_types::models::{NewUser, UserId};

use crate::error::ServiceError;
use crate::indexer::{ConversationIndexer, Draft};

pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_TEXT_CHARS: usize = 4096;
const MIN_PASSWORD_LEN: usize = 8;

/// Entry point for every request. Methods block on the store and on RSA
/// work; async callers run them on the blocking pool.
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    identities: Arc<dyn IdentityStore>,
    keys: KeyExchange,
    tokens: SessionTokens,
    live: LiveChannel,
    indexer: ConversationIndexer,
    default_page_size: u32,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        identities: Arc<dyn IdentityStore>,
        keys: KeyExchange,
        tokens: SessionTokens,
        live: LiveChannel,
        default_page_size: u32,
    ) -> Self {
        let indexer = ConversationIndexer::new(store.clone(), live.clone());
        Self {
            store,
            identities,
            keys,
            tokens,
            live,
            indexer,
            default_page_size: default_page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn live(&self) -> &LiveChannel {
        &self.live
    }

    // -- Key exchange --

    pub fn issue_session_key(&self) -> Result<SessionKeyResponse, ServiceError> {
        let (session_id, public_key) = self.keys.issue_keypair()?;
        Ok(SessionKeyResponse {
            session_id,
            public_key,
        })
    }

    pub fn session_public_key(&self, session_id: &str) -> Result<PublicKeyResponse, ServiceError> {
        match self.keys.public_key_of(session_id) {
            Ok(public_key) => Ok(PublicKeyResponse { public_key }),
            Err(KeyError::KeyNotFound(_)) => Err(ServiceError::NotFound("session")),
            Err(e) => Err(e.into()),
        }
    }

    // -- Identity --

    pub fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ServiceError> {
        let login = self.decrypt_field(&req.session_id, &req.login)?;
        let password = self.decrypt_field(&req.session_id, &req.password)?;

        let login = login.trim();
        let handle = req.handle.trim();
        if req.name.trim().is_empty() || handle.is_empty() || login.is_empty() {
            return Err(ServiceError::Validation("name, handle and login are required".into()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(ServiceError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let taken = self
            .identities
            .count_by_handle_or_login(handle, login)
            .map_err(ServiceError::store)?;
        if taken > 0 {
            return Err(ServiceError::Validation("handle or login already taken".into()));
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| ServiceError::Encryption(format!("password hashing failed: {}", e)))?
            .to_string();

        let user = self
            .identities
            .create(NewUser {
                name: req.name.trim().to_string(),
                surname: req.surname.trim().to_string(),
                handle: handle.to_string(),
                login: login.to_string(),
                password_hash,
            })
            .map_err(ServiceError::store)?;

        self.store.provision(user.id).map_err(ServiceError::store)?;

        info!("Registered user {} ({})", user.id, user.handle);
        Ok(RegisterResponse { user_id: user.id })
    }

    /// Verify credentials, record the client's key as the user's message key
    /// and return a token only that client can read.
    pub fn login(&self, req: LoginRequest) -> Result<LoginResponse, ServiceError> {
        let login = self.decrypt_field(&req.session_id, &req.login)?;
        let password = self.decrypt_field(&req.session_id, &req.password)?;

        let user = self
            .identities
            .find_by_login(login.trim())
            .map_err(ServiceError::store)?
            .ok_or_else(|| ServiceError::Authentication("invalid credentials".into()))?;

        let parsed_hash = PasswordHash::new(&user.password_hash)
            .map_err(|_| ServiceError::Authentication("invalid credentials".into()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| ServiceError::Authentication("invalid credentials".into()))?;

        // Keys are stored without surrounding whitespace.
        let public_key = req.public_key.trim();
        parse_public_key(public_key).map_err(|e| ServiceError::Validation(format!("public_key: {}", e)))?;

        self.store
            .set_user_key(user.id, public_key)
            .map_err(ServiceError::store)?;

        let token = self.tokens.mint(user.id)?;
        let token = self.keys.encrypt_for(public_key, token.as_bytes())?;

        info!("User {} logged in", user.id);
        Ok(LoginResponse {
            user_id: user.id,
            token,
        })
    }

    /// Resolve the caller from a bearer token. With a session id the token
    /// arrives encrypted under that session's key.
    pub fn authenticate(&self, token: &str, session_id: Option<&str>) -> Result<UserId, ServiceError> {
        let token = match session_id {
            Some(session_id) => self.keys.decrypt_text(session_id, token).map_err(|e| match e {
                KeyError::Vault(e) => ServiceError::StoreUnavailable(e),
                _ => ServiceError::Authentication("session token could not be unwrapped".into()),
            })?,
            None => token.to_string(),
        };

        Ok(self.tokens.verify(&token)?)
    }

    // -- Conversations --

    pub fn create_conversation(
        &self,
        caller: UserId,
        req: CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ServiceError> {
        if req.companion_id == caller {
            return Err(ServiceError::Validation("cannot open a conversation with yourself".into()));
        }

        let found = self
            .identities
            .find_by_ids(&[req.companion_id])
            .map_err(ServiceError::store)?;
        if found.is_empty() {
            return Err(ServiceError::NotFound("companion"));
        }

        self.store.provision(caller).map_err(ServiceError::store)?;
        self.store.provision(req.companion_id).map_err(ServiceError::store)?;

        let conversation_id = self.indexer.create(caller, req.companion_id, req.secured)?;
        Ok(CreateConversationResponse { conversation_id })
    }

    pub fn list_conversations(
        &self,
        caller: UserId,
        query: ListConversationsQuery,
    ) -> Result<ListConversationsResponse, ServiceError> {
        let page_size = query
            .page_size
            .unwrap_or(self.default_page_size)
            .clamp(1, MAX_PAGE_SIZE);

        let cursor = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
            Some(raw) => Some(PageCursor::decode(raw).map_err(|e| ServiceError::Validation(e.to_string()))?),
            None => None,
        };

        let page = self
            .store
            .list_summaries(caller, page_size, cursor.as_ref(), query.secured)
            .map_err(ServiceError::store)?;

        let summaries = self.enrich(page.summaries.iter().map(ConversationView::from).collect())?;
        Ok(ListConversationsResponse {
            summaries,
            next_cursor: page.next.map(|c| c.encode()),
        })
    }

    /// Merge companion profiles into a page. Companions the identity store
    /// does not know are kept as they are.
    fn enrich(&self, mut views: Vec<ConversationView>) -> Result<Vec<ConversationView>, ServiceError> {
        let ids: Vec<UserId> = views
            .iter()
            .map(|v| v.companion_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(views);
        }

        let profiles: HashMap<UserId, _> = self
            .identities
            .find_by_ids(&ids)
            .map_err(ServiceError::store)?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        for view in &mut views {
            match profiles.get(&view.companion_id) {
                Some(user) => {
                    view.companion_name = Some(user.name.clone());
                    view.companion_surname = Some(user.surname.clone());
                    view.companion_handle = Some(user.handle.clone());
                }
                None => debug!("No profile for companion {}", view.companion_id),
            }
        }
        Ok(views)
    }

    // -- Messages --

    pub fn post_message(
        &self,
        caller: UserId,
        conversation_id: Uuid,
        req: PostMessageRequest,
    ) -> Result<PostMessageResponse, ServiceError> {
        let text = match req.session_id.as_deref() {
            Some(session_id) => self.decrypt_field(session_id, &req.text)?,
            None => req.text,
        };
        validate_text(&text)?;

        let sent = self.indexer.send(
            caller,
            Draft {
                conversation_id,
                text,
                reply_to: req.reply_to,
                forwarded_from: req.forwarded_from,
                temporary_message_id: req.temporary_message_id,
            },
        )?;

        Ok(PostMessageResponse {
            status: "sent".into(),
            message_id: sent.message_id,
            created_at: sent.created_at,
        })
    }

    pub fn list_messages(&self, caller: UserId, conversation_id: Uuid) -> Result<ListMessagesResponse, ServiceError> {
        self.store
            .find_summary_by_chat(caller, conversation_id)
            .map_err(ServiceError::store)?
            .ok_or(ServiceError::NotFound("conversation"))?;

        let messages = self
            .store
            .list_messages(caller, conversation_id)
            .map_err(ServiceError::store)?
            .iter()
            .map(|m| MessageView::for_viewer(m, caller))
            .collect();

        Ok(ListMessagesResponse { messages })
    }

    pub fn mark_read(
        &self,
        caller: UserId,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<StatusResponse, ServiceError> {
        self.indexer.read(caller, conversation_id, message_id)?;
        Ok(StatusResponse { status: "read".into() })
    }

    fn decrypt_field(&self, session_id: &str, ciphertext: &str) -> Result<String, ServiceError> {
        self.keys.decrypt_text(session_id, ciphertext).map_err(|e| {
            if matches!(e, KeyError::KeyNotFound(_)) {
                warn!("Request referenced unknown session {}", session_id);
            }
            e.into()
        })
    }
}

fn validate_text(text: &str) -> Result<(), ServiceError> {
    if text.trim().is_empty() {
        return Err(ServiceError::Validation("text must not be empty".into()));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(ServiceError::Validation(format!(
            "text exceeds {} characters",
            MAX_TEXT_CHARS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use hush_crypto::encrypt;
    use hush_types::events::LiveEvent;

    use super::*;
    use crate::testing::Fixture;

    /// Encrypt a field for the server session the way a client would.
    fn seal(service: &ConversationService, session_id: &str, plaintext: &str) -> String {
        let pem = service.session_public_key(session_id).unwrap().public_key;
        encrypt::seal(&parse_public_key(&pem).unwrap(), plaintext.as_bytes()).unwrap()
    }

    fn post(text: &str) -> PostMessageRequest {
        PostMessageRequest {
            text: text.to_string(),
            session_id: None,
            reply_to: None,
            forwarded_from: None,
            temporary_message_id: None,
        }
    }

    fn open_with(service: &ConversationService, caller: UserId, companion: UserId) -> Uuid {
        service
            .create_conversation(
                caller,
                CreateConversationRequest {
                    companion_id: companion,
                    secured: false,
                },
            )
            .unwrap()
            .conversation_id
    }

    #[test]
    fn register_then_login_returns_token_for_client_key() {
        let fx = Fixture::new();
        let service = fx.service();

        let session = service.issue_session_key().unwrap();
        let registered = service
            .register(RegisterRequest {
                session_id: session.session_id.clone(),
                name: "Dana".into(),
                surname: "Scully".into(),
                handle: "@dana".into(),
                login: seal(&service, &session.session_id, "dana"),
                password: seal(&service, &session.session_id, "trustno1!"),
            })
            .unwrap();

        // Partition is ready for conversations straight away.
        assert!(fx.db.list_summaries(registered.user_id, 10, None, None).unwrap().summaries.is_empty());

        let login = service
            .login(LoginRequest {
                session_id: session.session_id.clone(),
                login: seal(&service, &session.session_id, "dana"),
                password: seal(&service, &session.session_id, "trustno1!"),
                public_key: format!("\n{}\n", fx.alice.public_key),
            })
            .unwrap();
        assert_eq!(login.user_id, registered.user_id);

        // Only the holder of the client key can read the token.
        let token = fx.open(&fx.alice, &login.token);
        assert_eq!(service.authenticate(&token, None).unwrap(), registered.user_id);
        assert_eq!(fx.db.user_key(registered.user_id).unwrap().as_deref(), Some(fx.alice.public_key.as_str()));
    }

    #[test]
    fn login_rejects_wrong_password_and_unknown_session() {
        let fx = Fixture::new();
        let service = fx.service();
        let session = service.issue_session_key().unwrap();

        service
            .register(RegisterRequest {
                session_id: session.session_id.clone(),
                name: "Fox".into(),
                surname: "Mulder".into(),
                handle: "@fox".into(),
                login: seal(&service, &session.session_id, "fox"),
                password: seal(&service, &session.session_id, "iwanttobelieve"),
            })
            .unwrap();

        let err = service
            .login(LoginRequest {
                session_id: session.session_id.clone(),
                login: seal(&service, &session.session_id, "fox"),
                password: seal(&service, &session.session_id, "wrong-password"),
                public_key: fx.alice.public_key.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Authentication(_)));

        let err = service
            .login(LoginRequest {
                session_id: "no-such-session".into(),
                login: "x".into(),
                password: "y".into(),
                public_key: fx.alice.public_key.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Authentication(_)));
    }

    #[test]
    fn register_rejects_duplicate_login() {
        let fx = Fixture::new();
        let service = fx.service();
        let session = service.issue_session_key().unwrap();

        // "alice" is already taken by the fixture.
        let err = service
            .register(RegisterRequest {
                session_id: session.session_id.clone(),
                name: "Alice".into(),
                surname: "Again".into(),
                handle: "@alice2".into(),
                login: seal(&service, &session.session_id, "alice"),
                password: seal(&service, &session.session_id, "long-enough"),
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn authenticate_accepts_plain_and_session_wrapped_tokens() {
        let fx = Fixture::new();
        let service = fx.service();
        let token = SessionTokens::from_secret("test-secret").mint(fx.alice.id).unwrap();

        assert_eq!(service.authenticate(&token, None).unwrap(), fx.alice.id);

        let session = service.issue_session_key().unwrap();
        let wrapped = seal(&service, &session.session_id, &token);
        assert_eq!(service.authenticate(&wrapped, Some(&session.session_id)).unwrap(), fx.alice.id);

        assert!(matches!(
            service.authenticate(&wrapped, Some("expired")),
            Err(ServiceError::Authentication(_))
        ));
        let forged = SessionTokens::from_secret("other-secret").mint(fx.alice.id).unwrap();
        assert!(matches!(
            service.authenticate(&forged, None),
            Err(ServiceError::Authentication(_))
        ));
    }

    #[test]
    fn create_validates_companion() {
        let fx = Fixture::new();
        let service = fx.service();

        let err = service
            .create_conversation(
                fx.alice.id,
                CreateConversationRequest {
                    companion_id: fx.alice.id,
                    secured: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = service
            .create_conversation(
                fx.alice.id,
                CreateConversationRequest {
                    companion_id: 9_999,
                    secured: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound("companion")));
    }

    #[test]
    fn listing_enriches_companions_and_keeps_unknown_ones() {
        let fx = Fixture::new();
        let service = fx.service();
        let id = open_with(&service, fx.alice.id, fx.bob.id);

        // A summary whose companion has no identity record.
        fx.db.provision(4_242).unwrap();
        let ghost = fx.indexer().create(fx.alice.id, 4_242, false);
        assert!(ghost.is_ok());

        let page = service
            .list_conversations(fx.alice.id, ListConversationsQuery::default())
            .unwrap();
        assert_eq!(page.summaries.len(), 2);

        let bob = page.summaries.iter().find(|s| s.conversation_id == id).unwrap();
        assert_eq!(bob.companion_handle.as_deref(), Some("@bob"));
        assert_eq!(bob.companion_name.as_deref(), Some("bob"));

        let unknown = page.summaries.iter().find(|s| s.companion_id == 4_242).unwrap();
        assert!(unknown.companion_name.is_none());
    }

    #[test]
    fn listing_pages_until_empty() {
        let fx = Fixture::new();
        let service = fx.service();
        let mut expected = Vec::new();
        for i in 0..5 {
            let other = fx.user(&format!("user{}", i), None);
            expected.push(open_with(&service, fx.alice.id, other));
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = service
                .list_conversations(
                    fx.alice.id,
                    ListConversationsQuery {
                        cursor: cursor.clone(),
                        page_size: Some(2),
                        secured: None,
                    },
                )
                .unwrap();
            if page.summaries.is_empty() {
                assert!(page.next_cursor.is_none());
                break;
            }
            seen.extend(page.summaries.iter().map(|s| s.conversation_id));
            cursor = page.next_cursor;
        }

        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);

        let err = service
            .list_conversations(
                fx.alice.id,
                ListConversationsQuery {
                    cursor: Some("garbage".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn post_list_and_read_flow() {
        let fx = Fixture::new();
        let service = fx.service();
        let id = open_with(&service, fx.alice.id, fx.bob.id);

        let sent = service.post_message(fx.alice.id, id, post("hello bob")).unwrap();
        assert_eq!(sent.status, "sent");

        let bob_view = service.list_messages(fx.bob.id, id).unwrap().messages;
        assert_eq!(bob_view.len(), 1);
        assert!(!bob_view[0].is_my_message);
        assert_eq!(fx.open(&fx.bob, &bob_view[0].body), "hello bob");

        let alice_view = service.list_messages(fx.alice.id, id).unwrap().messages;
        assert!(alice_view[0].is_my_message);

        let (_, mut alice_rx) = service.live().open(fx.alice.id);
        let status = service.mark_read(fx.bob.id, id, sent.message_id).unwrap();
        assert_eq!(status.status, "read");
        assert!(matches!(alice_rx.try_recv(), Ok(LiveEvent::Read { reader_id, .. }) if reader_id == fx.bob.id));

        assert!(service.list_messages(fx.alice.id, id).unwrap().messages[0].read);
    }

    #[test]
    fn post_decrypts_session_text_and_validates() {
        let fx = Fixture::new();
        let service = fx.service();
        let id = open_with(&service, fx.alice.id, fx.bob.id);

        let session = service.issue_session_key().unwrap();
        let mut req = post(&seal(&service, &session.session_id, "sealed hello"));
        req.session_id = Some(session.session_id.clone());
        service.post_message(fx.alice.id, id, req).unwrap();

        let stored = service.list_messages(fx.bob.id, id).unwrap().messages;
        assert_eq!(fx.open(&fx.bob, &stored[0].body), "sealed hello");

        let too_long = "x".repeat(MAX_TEXT_CHARS + 1);
        for bad in ["", "   \n", too_long.as_str()] {
            let err = service.post_message(fx.alice.id, id, post(bad)).unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)));
        }
        assert!(service.post_message(fx.alice.id, id, post(&"y".repeat(MAX_TEXT_CHARS))).is_ok());
    }

    #[test]
    fn strangers_cannot_list_a_conversation() {
        let fx = Fixture::new();
        let service = fx.service();
        let id = open_with(&service, fx.alice.id, fx.bob.id);
        let eve = fx.user("eve", None);

        let err = service.list_messages(eve, id).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound("conversation")));
    }
}
