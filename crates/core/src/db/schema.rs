diesel::table! {
    transactions (transaction_id) {
        transaction_id -> Text,
        device_id -> Text,
        establishment_id -> Nullable<Text>,
        amount -> Float8,
        status -> Text,
        ticket_id -> Nullable<Text>,
        error_reason -> Nullable<Text>,
        created_at -> Int8,
        updated_at -> Int8,
    }
}

diesel::table! {
    devices (device_id) {
        device_id -> Text,
        secret_key -> Text,
        status -> Text,
        establishment_id -> Nullable<Text>,
        last_seen -> Nullable<Int8>,
        uptime_seconds -> Nullable<Int8>,
        firmware_version -> Nullable<Text>,
        free_memory -> Nullable<Int8>,
        healthy -> Nullable<Bool>,
        created_at -> Int8,
        updated_at -> Int8,
    }
}

diesel::table! {
    tickets (id) {
        id -> Text,
        establishment_id -> Nullable<Text>,
        number -> Int8,
        vip -> Bool,
        status -> Text,
        transaction_id -> Nullable<Text>,
        created_at -> Int8,
    }
}

diesel::allow_tables_to_appear_in_same_query!(transactions, devices, tickets);
