//! Storage data models.

/// The persisted record of a subscription.
///
/// Records are created when a subscription is stored and survive in the store
/// for as long as the subscription (or, for a durable queue group's shadow,
/// the group) is alive.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubRecord {
    /// The store-assigned stable ID of this subscription.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// The owning client's ID; empty while a durable is detached.
    #[prost(string, tag = "2")]
    pub client_id: ::prost::alloc::string::String,
    /// The channel subject.
    #[prost(string, tag = "3")]
    pub subject: ::prost::alloc::string::String,
    /// The queue group name; for durable queue groups this is the composite
    /// `durable:group` form.
    #[prost(string, tag = "4")]
    pub q_group: ::prost::alloc::string::String,
    /// The delivery inbox.
    #[prost(string, tag = "5")]
    pub inbox: ::prost::alloc::string::String,
    /// The ack inbox.
    #[prost(string, tag = "6")]
    pub ack_inbox: ::prost::alloc::string::String,
    /// The durable name, when durable.
    #[prost(string, tag = "7")]
    pub durable_name: ::prost::alloc::string::String,
    /// Maximum unacknowledged deliveries.
    #[prost(uint32, tag = "8")]
    pub max_in_flight: u32,
    /// Ack wait in seconds.
    #[prost(int32, tag = "9")]
    pub ack_wait_in_secs: i32,
    /// The last sequence sent to this subscription.
    #[prost(uint64, tag = "10")]
    pub last_sent: u64,
    /// Whether this subscription survives client disconnects.
    #[prost(bool, tag = "11")]
    pub is_durable: bool,
}
