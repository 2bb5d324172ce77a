diesel::table! {
    ghosts (id) {
        id -> BigInt,
        matrix_user_id -> Text,
        mm_username -> Text,
        mm_user_id -> Nullable<Text>,
        metadata -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    puppets (id) {
        id -> BigInt,
        mm_user_id -> Text,
        matrix_user_id -> Text,
        display_name -> Nullable<Text>,
        avatar_id -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    portals (id) {
        id -> BigInt,
        conversation_id -> Text,
        receiver -> Text,
        kind -> Text,
        matrix_room_id -> Nullable<Text>,
        parent_id -> Nullable<Text>,
        name -> Nullable<Text>,
        topic -> Nullable<Text>,
        relay_login_id -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    user_logins (id) {
        id -> Text,
        matrix_user_id -> Text,
        metadata -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    message_mappings (id) {
        id -> BigInt,
        mm_post_id -> Text,
        part_index -> Integer,
        mm_channel_id -> Text,
        matrix_room_id -> Text,
        matrix_event_id -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reaction_mappings (id) {
        id -> BigInt,
        mm_post_id -> Text,
        mm_user_id -> Text,
        emoji_name -> Text,
        matrix_room_id -> Text,
        matrix_event_id -> Text,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    ghosts,
    puppets,
    portals,
    user_logins,
    message_mappings,
    reaction_mappings,
);
