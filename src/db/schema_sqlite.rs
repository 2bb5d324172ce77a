diesel::table! {
    ghosts (id) {
        id -> Integer,
        matrix_user_id -> Text,
        mm_username -> Text,
        mm_user_id -> Nullable<Text>,
        metadata -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    puppets (id) {
        id -> Integer,
        mm_user_id -> Text,
        matrix_user_id -> Text,
        display_name -> Nullable<Text>,
        avatar_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    portals (id) {
        id -> Integer,
        conversation_id -> Text,
        receiver -> Text,
        kind -> Text,
        matrix_room_id -> Nullable<Text>,
        parent_id -> Nullable<Text>,
        name -> Nullable<Text>,
        topic -> Nullable<Text>,
        relay_login_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    user_logins (id) {
        id -> Text,
        matrix_user_id -> Text,
        metadata -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    message_mappings (id) {
        id -> Integer,
        mm_post_id -> Text,
        part_index -> Integer,
        mm_channel_id -> Text,
        matrix_room_id -> Text,
        matrix_event_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    reaction_mappings (id) {
        id -> Integer,
        mm_post_id -> Text,
        mm_user_id -> Text,
        emoji_name -> Text,
        matrix_room_id -> Text,
        matrix_event_id -> Text,
        created_at -> Text,
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
