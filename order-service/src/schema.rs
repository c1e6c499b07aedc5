diesel::table! {
    orders (id) {
        id -> Uuid,
        saga_id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        currency -> Varchar,
        status -> Varchar,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
