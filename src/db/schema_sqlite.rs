// Ids are decimal text, timestamps RFC 3339 text, sets JSON text.

diesel::table! {
    communities (id) {
        id -> Text,
        name -> Text,
        owner_id -> Nullable<Text>,
        icon -> Nullable<Text>,
        description -> Nullable<Text>,
        created_at -> Text,
        last_synced_at -> Nullable<Text>,
    }
}

diesel::table! {
    channels (id) {
        id -> Text,
        community_id -> Text,
        parent_id -> Nullable<Text>,
        kind -> Integer,
        name -> Text,
        topic -> Nullable<Text>,
        position -> Integer,
        nsfw -> Bool,
        flags -> BigInt,
        created_at -> Text,
        last_synced_at -> Nullable<Text>,
    }
}

diesel::table! {
    roles (id) {
        id -> Text,
        community_id -> Text,
        name -> Text,
        color -> Integer,
        position -> Integer,
        permissions -> Text,
        hoisted -> Bool,
        mentionable -> Bool,
        managed -> Bool,
    }
}

diesel::table! {
    users (id) {
        id -> Text,
        username -> Text,
        display_name -> Nullable<Text>,
        avatar -> Nullable<Text>,
        bot -> Bool,
        created_at -> Text,
        last_seen_at -> Nullable<Text>,
    }
}

diesel::table! {
    members (user_id, community_id) {
        user_id -> Text,
        community_id -> Text,
        nickname -> Nullable<Text>,
        joined_at -> Nullable<Text>,
        role_ids -> Text,
        pending -> Bool,
        last_synced_at -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> Text,
        channel_id -> Text,
        author_id -> Text,
        content -> Text,
        kind -> Integer,
        pinned -> Bool,
        tts -> Bool,
        created_at -> Text,
        edited_at -> Nullable<Text>,
        reference_id -> Nullable<Text>,
    }
}

diesel::table! {
    embeds (message_id, position) {
        message_id -> Text,
        position -> Integer,
        kind -> Nullable<Text>,
        title -> Nullable<Text>,
        description -> Nullable<Text>,
        url -> Nullable<Text>,
        color -> Nullable<Integer>,
        payload -> Text,
    }
}

diesel::table! {
    attachments (id) {
        id -> Text,
        message_id -> Text,
        filename -> Text,
        url -> Text,
        proxy_url -> Nullable<Text>,
        size -> BigInt,
        width -> Nullable<Integer>,
        height -> Nullable<Integer>,
        content_type -> Nullable<Text>,
        local_path -> Nullable<Text>,
        cached -> Bool,
        status -> Integer,
        content_hash -> Nullable<Text>,
        attempts -> Integer,
        last_error -> Nullable<Text>,
        skip_reason -> Nullable<Text>,
        retryable -> Bool,
        downloaded_at -> Nullable<Text>,
        updated_at -> Text,
    }
}

diesel::table! {
    reactions (message_id, emote_kind, emote_value) {
        message_id -> Text,
        emote_kind -> Text,
        emote_value -> Text,
        emote_name -> Text,
        reaction_count -> Integer,
        user_ids -> Text,
    }
}

diesel::table! {
    checkpoints (entity_type, entity_id) {
        entity_type -> Text,
        entity_id -> Text,
        status -> Integer,
        last_synced_at -> Nullable<Text>,
        cursor -> Nullable<Text>,
        error -> Nullable<Text>,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    communities,
    channels,
    roles,
    users,
    members,
    messages,
    embeds,
    attachments,
    reactions,
    checkpoints,
);
