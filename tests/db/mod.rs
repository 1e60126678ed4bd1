//! Fixture data for integration tests: a small fake "blog" dataset (users,
//! posts, comments) generated with `fakeit` + `uuid`, the same shape the
//! relational source tests exercise against a [`FakeRepo`]-style
//! in-memory backend.

use std::sync::Arc;
use uuid::Uuid;

pub struct Database {
    pub users: Vec<User>,
    pub posts: Vec<Post>,
    pub comments: Vec<Comment>,
}

impl Database {
    pub fn fake() -> Arc<Self> {
        let users: Vec<_> = (0..50)
            .map(|_| User {
                id: Uuid::new_v4(),
                name: fakeit::name::full(),
            })
            .collect();
        let posts: Vec<_> = users
            .iter()
            .enumerate()
            .flat_map(|(n, user)| {
                (0..(n % 4)).map(move |_| Post {
                    id: Uuid::new_v4(),
                    user_id: user.id,
                    body: fakeit::words::sentence(3),
                })
            })
            .collect();
        let comments: Vec<_> = posts
            .iter()
            .enumerate()
            .flat_map(|(n, post)| {
                let commenter = &users[n % users.len()];
                (0..3).map(move |_| Comment {
                    id: Uuid::new_v4(),
                    post_id: post.id,
                    user_id: commenter.id,
                    comment: fakeit::words::sentence(2),
                })
            })
            .collect();

        Arc::new(Database {
            users,
            posts,
            comments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub comment: String,
}
