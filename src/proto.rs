//! Wire protocol message models.
//!
//! All records exchanged between clients and the broker are encoded with the
//! compact field-tagged binary encoding provided by `prost`. The models are
//! maintained here in checked-in generated form.

/// The starting point of a new subscription within its channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StartPosition {
    /// Deliver only messages published after the subscription is created.
    NewOnly = 0,
    /// Start with the last message received on the channel.
    LastReceived = 1,
    /// Start at a point in time computed as `now - start_time_delta`.
    TimeDeltaStart = 2,
    /// Start at the given sequence number.
    SequenceStart = 3,
    /// Deliver from the first available message on the channel.
    First = 4,
}

/// A request to register a new client connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    /// The unique ID of the connecting client.
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    /// The inbox on which the client answers heartbeat probes.
    #[prost(string, tag = "2")]
    pub heartbeat_inbox: ::prost::alloc::string::String,
}

/// The response to a connect request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    /// The subject prefix on which the client is to publish messages.
    #[prost(string, tag = "1")]
    pub pub_prefix: ::prost::alloc::string::String,
    /// The subject on which subscription requests are received.
    #[prost(string, tag = "2")]
    pub sub_requests: ::prost::alloc::string::String,
    /// The subject on which unsubscribe requests are received.
    #[prost(string, tag = "3")]
    pub unsub_requests: ::prost::alloc::string::String,
    /// The subject on which close requests are received.
    #[prost(string, tag = "4")]
    pub close_requests: ::prost::alloc::string::String,
    /// A protocol error, if the request was rejected.
    #[prost(string, tag = "5")]
    pub error: ::prost::alloc::string::String,
}

/// A message published by a client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubMsg {
    /// A client-generated guid identifying this publish for its ack.
    #[prost(string, tag = "1")]
    pub guid: ::prost::alloc::string::String,
    /// The publishing client's ID.
    #[prost(string, tag = "2")]
    pub client_id: ::prost::alloc::string::String,
    /// The channel subject being published to.
    #[prost(string, tag = "3")]
    pub subject: ::prost::alloc::string::String,
    /// An optional reply subject carried through to subscribers.
    #[prost(string, tag = "4")]
    pub reply: ::prost::alloc::string::String,
    /// The message payload.
    #[prost(bytes = "vec", tag = "5")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// The broker's acknowledgement of a published message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubAck {
    /// The guid of the publish being acknowledged.
    #[prost(string, tag = "1")]
    pub guid: ::prost::alloc::string::String,
    /// A protocol error, if the publish was rejected.
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

/// A committed channel message as delivered to subscribers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MsgProto {
    /// The channel-scoped sequence number, starting at 1.
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    /// The channel subject.
    #[prost(string, tag = "2")]
    pub subject: ::prost::alloc::string::String,
    /// An optional reply subject.
    #[prost(string, tag = "3")]
    pub reply: ::prost::alloc::string::String,
    /// The message payload.
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Commit timestamp, nanoseconds since the unix epoch.
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
    /// Set only on copies handed to redelivery.
    #[prost(bool, tag = "6")]
    pub redelivered: bool,
}

/// A request to create a subscription on a channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionRequest {
    /// The subscribing client's ID.
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    /// The channel subject to subscribe to.
    #[prost(string, tag = "2")]
    pub subject: ::prost::alloc::string::String,
    /// The queue group to join, if any.
    #[prost(string, tag = "3")]
    pub q_group: ::prost::alloc::string::String,
    /// The inbox on which the subscriber receives deliveries.
    #[prost(string, tag = "4")]
    pub inbox: ::prost::alloc::string::String,
    /// The maximum number of unacknowledged deliveries.
    #[prost(uint32, tag = "5")]
    pub max_in_flight: u32,
    /// How long the broker waits for an ack before redelivering, in seconds.
    #[prost(int32, tag = "6")]
    pub ack_wait_in_secs: i32,
    /// Where in the channel the subscription starts.
    #[prost(enumeration = "StartPosition", tag = "7")]
    pub start_position: i32,
    /// The start sequence, for `StartPosition::SequenceStart`.
    #[prost(uint64, tag = "8")]
    pub start_sequence: u64,
    /// The time delta in nanoseconds, for `StartPosition::TimeDeltaStart`.
    #[prost(int64, tag = "9")]
    pub start_time_delta: i64,
    /// The durable name, if the subscription survives disconnects.
    #[prost(string, tag = "10")]
    pub durable_name: ::prost::alloc::string::String,
}

/// The response to a subscription or unsubscribe request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionResponse {
    /// The broker-chosen subject on which the subscriber publishes acks.
    #[prost(string, tag = "1")]
    pub ack_inbox: ::prost::alloc::string::String,
    /// A protocol error, if the request was rejected.
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

/// A request to remove a subscription.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnsubscribeRequest {
    /// The owning client's ID.
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    /// The channel subject of the subscription.
    #[prost(string, tag = "2")]
    pub subject: ::prost::alloc::string::String,
    /// The ack inbox identifying the subscription.
    #[prost(string, tag = "3")]
    pub inbox: ::prost::alloc::string::String,
}

/// A subscriber's acknowledgement of a delivered message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    /// The channel subject of the acked message.
    #[prost(string, tag = "1")]
    pub subject: ::prost::alloc::string::String,
    /// The sequence being acknowledged.
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

/// A request to close a client connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseRequest {
    /// The ID of the client being closed.
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
}

/// The response to a close request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseResponse {
    /// A protocol error, if the request was rejected.
    #[prost(string, tag = "1")]
    pub error: ::prost::alloc::string::String,
}
