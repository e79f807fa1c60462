//! Rooms and their admission rules.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use serde::Serialize;

use crate::aefrp::{
    identity::{Acl, AclDecision, Fingerprint},
    tunnel::{
        control::ControlHandle,
        portmap::PortMap,
        secure::{Reject, reason},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Owned by this process; its ports are terminated here.
    Local,
    /// Registered by a host connected to this relay.
    Hosted,
    /// Mirrored from a host this relay dials itself.
    Remote,
}

#[derive(Debug, Clone, Default)]
pub struct RoomInfo {
    pub name: String,
    pub motd: String,
    pub ports: PortMap,
}

/// Live connection toward the room's host, used to push bridged peers.
#[derive(Debug, Clone)]
pub struct HostLink {
    pub conn_id: u64,
    pub peer: Fingerprint,
    pub control: ControlHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub id: u64,
    pub name: String,
    pub fingerprint: Fingerprint,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub fingerprint: Fingerprint,
    pub kind: RoomKind,
    pub name: String,
    pub motd: String,
    pub ready: bool,
    pub host: Option<Fingerprint>,
    pub ports: PortMap,
    pub members: Vec<MemberInfo>,
}

#[derive(Debug)]
pub struct Room {
    pub fingerprint: Fingerprint,
    pub kind: RoomKind,
    info: RwLock<RoomInfo>,
    acl: RwLock<Acl>,
    host: Mutex<Option<HostLink>>,
    members: Mutex<HashMap<u64, MemberInfo>>,
    ready: AtomicBool,
}

impl Room {
    pub fn new(fingerprint: Fingerprint, kind: RoomKind, info: RoomInfo, acl: Acl) -> Self {
        Self {
            fingerprint,
            kind,
            info: RwLock::new(info),
            acl: RwLock::new(acl),
            host: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(kind == RoomKind::Local),
        }
    }

    pub fn info(&self) -> RoomInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_info(&self, info: RoomInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub fn check_acl(&self, peer: &Fingerprint) -> AclDecision {
        self.acl
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(peer)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    fn host(&self) -> MutexGuard<'_, Option<HostLink>> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn members(&self) -> MutexGuard<'_, HashMap<u64, MemberInfo>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The host link, if it is still alive.
    pub fn host_link(&self) -> Option<HostLink> {
        self.host()
            .as_ref()
            .filter(|l| !l.control.is_closed())
            .cloned()
    }

    pub fn attach_host(&self, link: HostLink) {
        *self.host() = Some(link);
    }

    /// Detaches the host link if it still belongs to `conn_id`.
    pub fn detach_host(&self, conn_id: u64) -> bool {
        let mut host = self.host();
        if host.as_ref().is_some_and(|l| l.conn_id == conn_id) {
            *host = None;
            return true;
        }
        false
    }

    pub fn add_member(&self, m: MemberInfo) {
        self.members().insert(m.id, m);
    }

    pub fn remove_member(&self, id: u64) -> bool {
        self.members().remove(&id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let info = self.info();
        let mut members: Vec<_> = self.members().values().cloned().collect();
        members.sort_by_key(|m| m.id);
        RoomSnapshot {
            fingerprint: self.fingerprint,
            kind: self.kind,
            name: info.name,
            motd: info.motd,
            ready: self.is_ready(),
            host: self.host().as_ref().map(|l| l.peer),
            ports: info.ports,
            members,
        }
    }
}

pub type RoomMap = Arc<DashMap<Fingerprint, Arc<Room>>>;

/// A room registered during a handshake. Dropped without [`RoomClaim::commit`], it
/// unregisters the room again.
#[derive(Debug)]
pub struct RoomClaim {
    rooms: RoomMap,
    room: Arc<Room>,
    committed: bool,
}

impl RoomClaim {
    /// Registers `room` unless its fingerprint is already taken.
    pub fn try_new(rooms: &RoomMap, room: Room) -> Option<Self> {
        use dashmap::mapref::entry::Entry;

        match rooms.entry(room.fingerprint) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                let room = Arc::new(room);
                v.insert(room.clone());
                Some(Self {
                    rooms: rooms.clone(),
                    room,
                    committed: false,
                })
            }
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn commit(mut self) -> Arc<Room> {
        self.committed = true;
        self.room.clone()
    }
}

impl Drop for RoomClaim {
    fn drop(&mut self) {
        if !self.committed {
            remove_room(&self.rooms, &self.room);
        }
    }
}

/// Removes `room` from the registry if it is still the registered instance.
pub fn remove_room(rooms: &RoomMap, room: &Arc<Room>) -> bool {
    rooms
        .remove_if(&room.fingerprint, |_, r| Arc::ptr_eq(r, room))
        .is_some()
}

/// How an authenticated peer is served.
#[derive(Debug)]
pub enum Admission {
    /// Peer creates a room keyed by its own fingerprint and becomes its host.
    Host(RoomClaim),
    /// Peer joins a room whose ports this process terminates.
    Member(Arc<Room>),
    /// Peer is spliced through to the room's host.
    Redirect(Arc<Room>),
}

/// Decides what happens to `peer` asking for room `target`.
pub fn resolve(
    rooms: &RoomMap,
    peer: Fingerprint,
    target: Option<Fingerprint>,
    host_whitelist: &Acl,
) -> Result<Admission, Reject> {
    let Some(target) = target else {
        if rooms.contains_key(&peer) {
            return Err(Reject::new(reason::ROOM_ALREADY_EXIST));
        }
        if !host_whitelist.permits(&peer) {
            return Err(Reject::new(reason::SYSTEM_NOT_ALLOWED));
        }
        let room = Room::new(peer, RoomKind::Hosted, RoomInfo::default(), Acl::default());
        return RoomClaim::try_new(rooms, room)
            .map(Admission::Host)
            .ok_or_else(|| Reject::new(reason::ROOM_ALREADY_EXIST));
    };

    let room = rooms
        .get(&target)
        .map(|r| r.value().clone())
        .ok_or_else(|| Reject::new(reason::ROOM_NOT_FOUND))?;
    if !room.is_ready() {
        return Err(Reject::new(reason::ROOM_NOT_READY));
    }
    match room.check_acl(&peer) {
        AclDecision::Blocked => return Err(Reject::new(reason::ROOM_BLOCKED)),
        AclDecision::NotAllowed => return Err(Reject::new(reason::ROOM_NOT_ALLOWED)),
        AclDecision::Allowed => {}
    }
    if room.host_link().is_some() {
        return Ok(Admission::Redirect(room));
    }
    if room.kind == RoomKind::Local {
        return Ok(Admission::Member(room));
    }
    Err(Reject::new(reason::ROOM_NOT_READY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefrp::tunnel::control::command_queue;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::from_bytes([b; 32])
    }

    fn reject_reason(r: Result<Admission, Reject>) -> String {
        r.err().map(|e| e.reason().to_string()).unwrap_or_default()
    }

    #[test]
    fn room_creation_is_unique_per_fingerprint() {
        let rooms = RoomMap::default();
        let open = Acl::default();

        let Ok(Admission::Host(claim)) = resolve(&rooms, fp(1), None, &open) else {
            panic!("expected host admission");
        };
        assert!(!claim.room().is_ready());
        assert_eq!(
            reject_reason(resolve(&rooms, fp(1), None, &open)),
            reason::ROOM_ALREADY_EXIST
        );
        let room = claim.commit();
        assert!(rooms.contains_key(&fp(1)));
        assert!(remove_room(&rooms, &room));
        assert!(rooms.is_empty());
    }

    #[test]
    fn uncommitted_claim_unregisters_the_room() {
        let rooms = RoomMap::default();
        let adm = resolve(&rooms, fp(1), None, &Acl::default()).unwrap();
        assert_eq!(rooms.len(), 1);
        drop(adm);
        assert!(rooms.is_empty());
    }

    #[test]
    fn host_whitelist_gates_room_creation() {
        let rooms = RoomMap::default();
        let acl = Acl::whitelist([fp(2)]);
        assert_eq!(
            reject_reason(resolve(&rooms, fp(1), None, &acl)),
            reason::SYSTEM_NOT_ALLOWED
        );
        assert!(resolve(&rooms, fp(2), None, &acl).is_ok());
    }

    #[test]
    fn joining_reports_why_a_room_is_unavailable() {
        let rooms = RoomMap::default();
        let open = Acl::default();
        assert_eq!(
            reject_reason(resolve(&rooms, fp(9), Some(fp(1)), &open)),
            reason::ROOM_NOT_FOUND
        );

        let hosted = Room::new(fp(1), RoomKind::Hosted, RoomInfo::default(), Acl::default());
        rooms.insert(fp(1), Arc::new(hosted));
        assert_eq!(
            reject_reason(resolve(&rooms, fp(9), Some(fp(1)), &open)),
            reason::ROOM_NOT_READY
        );

        let mut acl = Acl::whitelist([fp(8), fp(9)]);
        acl.blacklist.insert(fp(9));
        let local = Room::new(fp(2), RoomKind::Local, RoomInfo::default(), acl);
        rooms.insert(fp(2), Arc::new(local));
        assert_eq!(
            reject_reason(resolve(&rooms, fp(9), Some(fp(2)), &open)),
            reason::ROOM_BLOCKED
        );
        assert_eq!(
            reject_reason(resolve(&rooms, fp(7), Some(fp(2)), &open)),
            reason::ROOM_NOT_ALLOWED
        );
        assert!(matches!(
            resolve(&rooms, fp(8), Some(fp(2)), &open),
            Ok(Admission::Member(_))
        ));
    }

    #[test]
    fn rooms_with_a_live_host_redirect() {
        let rooms = RoomMap::default();
        let room = Arc::new(Room::new(
            fp(1),
            RoomKind::Hosted,
            RoomInfo::default(),
            Acl::default(),
        ));
        let (control, rx) = command_queue();
        room.attach_host(HostLink {
            conn_id: 5,
            peer: fp(1),
            control,
        });
        room.set_ready(true);
        rooms.insert(fp(1), room.clone());

        assert!(matches!(
            resolve(&rooms, fp(3), Some(fp(1)), &Acl::default()),
            Ok(Admission::Redirect(_))
        ));

        // A dead control task no longer counts as a host link.
        drop(rx);
        assert_eq!(
            reject_reason(resolve(&rooms, fp(3), Some(fp(1)), &Acl::default())),
            reason::ROOM_NOT_READY
        );
        assert!(!room.detach_host(6));
        assert!(room.detach_host(5));
    }
}
